use actix_web::http::StatusCode;
use actix_web::{error, get, post, web, HttpResponse, Responder, ResponseError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use txcore::ErrorClass;
use txruntime::{NewFlow, ServiceError, TransactionService};

/// Application state shared across handlers
pub struct AppState {
    pub service: Arc<TransactionService>,
}

/// Uniform response body: `code` is 0 on success, else the HTTP status
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub code: u16,
    pub message: String,
    pub data: Option<T>,
}

impl<T: Serialize> Envelope<T> {
    fn ok(data: T) -> HttpResponse {
        HttpResponse::Ok().json(Envelope {
            code: 0,
            message: "success".to_string(),
            data: Some(data),
        })
    }
}

fn failure(status: StatusCode, message: impl Into<String>) -> HttpResponse {
    HttpResponse::build(status).json(Envelope::<()> {
        code: status.as_u16(),
        message: message.into(),
        data: None,
    })
}

#[derive(Debug, Error)]
#[error(transparent)]
pub struct ApiError(#[from] ServiceError);

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self.0.class() {
            ErrorClass::NotFound => StatusCode::NOT_FOUND,
            ErrorClass::BadRequest => StatusCode::BAD_REQUEST,
            ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        failure(self.status_code(), self.to_string())
    }
}

type ApiResult = Result<HttpResponse, ApiError>;

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    page: Option<usize>,
    page_size: Option<usize>,
    handled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    instance_id: String,
    flow_id: String,
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct HandleRequest {
    handled_by: Option<String>,
    remark: Option<String>,
}

#[derive(Debug, Serialize)]
struct TaskSummary<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    task_type: &'a str,
    description: &'a str,
    input_fields: usize,
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    Envelope::ok(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "txflow"
    }))
}

#[post("/api/v1/flows")]
async fn create_flow(data: web::Data<AppState>, body: web::Json<NewFlow>) -> ApiResult {
    let flow = data.service.create_flow(body.into_inner()).await?;
    Ok(Envelope::ok(flow))
}

#[get("/api/v1/flows")]
async fn list_flows(data: web::Data<AppState>, query: web::Query<PageQuery>) -> ApiResult {
    let page = data.service.list_flows(query.page, query.page_size).await?;
    Ok(Envelope::ok(page))
}

#[get("/api/v1/flows/{id}")]
async fn get_flow(data: web::Data<AppState>, path: web::Path<String>) -> ApiResult {
    let flow = data.service.get_flow(&path.into_inner()).await?;
    Ok(Envelope::ok(flow))
}

#[post("/api/v1/transactions")]
async fn start_transaction(data: web::Data<AppState>, body: web::Json<StartRequest>) -> ApiResult {
    let request = body.into_inner();
    info!(instance_id = %request.instance_id, flow_id = %request.flow_id, "Start transaction requested");
    let outcome = data
        .service
        .start_transaction(&request.instance_id, &request.flow_id, request.params)
        .await?;
    Ok(Envelope::ok(outcome))
}

#[get("/api/v1/transactions/{id}")]
async fn get_transaction(data: web::Data<AppState>, path: web::Path<String>) -> ApiResult {
    let view = data.service.get_transaction(&path.into_inner()).await?;
    Ok(Envelope::ok(view))
}

#[post("/api/v1/transactions/{id}/retry")]
async fn retry_transaction(data: web::Data<AppState>, path: web::Path<String>) -> ApiResult {
    let outcome = data.service.retry_transaction(&path.into_inner()).await?;
    Ok(Envelope::ok(outcome))
}

#[get("/api/v1/exceptions")]
async fn list_exceptions(data: web::Data<AppState>, query: web::Query<PageQuery>) -> ApiResult {
    let page = data
        .service
        .list_exceptions(query.page, query.page_size, query.handled)
        .await?;
    Ok(Envelope::ok(page))
}

#[post("/api/v1/exceptions/{id}/handle")]
async fn handle_exception(
    data: web::Data<AppState>,
    path: web::Path<i64>,
    body: Option<web::Json<HandleRequest>>,
) -> ApiResult {
    let request = body.map(|b| b.into_inner()).unwrap_or_default();
    let record = data
        .service
        .handle_exception(path.into_inner(), request.handled_by, request.remark)
        .await?;
    Ok(Envelope::ok(record))
}

#[post("/api/v1/exceptions/{id}/retry")]
async fn retry_exception(data: web::Data<AppState>, path: web::Path<i64>) -> ApiResult {
    let record = data.service.schedule_exception_retry(path.into_inner()).await?;
    Ok(Envelope::ok(record))
}

/// List registered task definitions
#[get("/api/v1/tasks")]
async fn list_tasks(data: web::Data<AppState>) -> impl Responder {
    let registry = data.service.engine().registry();
    let tasks: Vec<TaskSummary> = registry
        .list()
        .into_iter()
        .map(|d| TaskSummary {
            name: &d.name,
            task_type: &d.task_type,
            description: &d.description,
            input_fields: d.input_fields.len(),
        })
        .collect();
    Envelope::ok(tasks)
}

/// Malformed bodies and queries answer with the envelope too
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        let response = failure(StatusCode::BAD_REQUEST, err.to_string());
        error::InternalError::from_response(err, response).into()
    })
}

pub fn query_config() -> web::QueryConfig {
    web::QueryConfig::default().error_handler(|err, _req| {
        let response = failure(StatusCode::BAD_REQUEST, err.to_string());
        error::InternalError::from_response(err, response).into()
    })
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .app_data(query_config())
        .service(health_check)
        .service(create_flow)
        .service(list_flows)
        .service(get_flow)
        .service(start_transaction)
        .service(get_transaction)
        .service(retry_transaction)
        .service(list_exceptions)
        .service(handle_exception)
        .service(retry_exception)
        .service(list_tasks);
}
