mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use txcore::{DefinitionError, ErrorClass, InstanceStatus, RetryStrategy, TaskStatus};
use txruntime::{NewFlow, ServiceError, TransactionService};

fn service(h: &Harness) -> TransactionService {
    TransactionService::new(h.repos.clone(), h.engine.clone())
}

fn new_flow(definition: serde_json::Value) -> NewFlow {
    NewFlow {
        name: "payment".to_string(),
        description: "deduct then notify".to_string(),
        flow_type: "transaction".to_string(),
        definition,
        created_by: "ops".to_string(),
    }
}

fn payment_document() -> serde_json::Value {
    json!({
        "name": "payment",
        "tasks": [
            {"id": "t1", "task_name": "deduct"},
            {"id": "t2", "task_name": "notify", "depends_on": ["t1"]}
        ]
    })
}

#[tokio::test]
async fn start_runs_flow_in_background() {
    let h = harness(vec![ScriptedExecutor::ok("rpc"), ScriptedExecutor::ok("mq")], enforce());
    let service = service(&h);
    let flow = service.create_flow(new_flow(payment_document())).await.unwrap();
    assert_eq!(flow.created_by, "ops");
    assert!(flow.active);

    let outcome = service
        .start_transaction("order-1", &flow.id, payment_params())
        .await
        .unwrap();
    assert!(!outcome.replayed);
    assert_eq!(outcome.status, InstanceStatus::Pending);

    service.drain().await;
    let view = service.get_transaction("order-1").await.unwrap();
    assert_eq!(view.instance.status, InstanceStatus::Success);
    assert_eq!(view.tasks.len(), 2);

    let body = serde_json::to_value(&view).unwrap();
    assert_eq!(body["id"], "order-1");
    assert_eq!(body["status"], "success");
    assert_eq!(body["tasks"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn starting_an_existing_id_replays_current_status() {
    let rpc = ScriptedExecutor::ok("rpc");
    let h = harness(vec![rpc.clone(), ScriptedExecutor::ok("mq")], enforce());
    let service = service(&h);
    let flow = service.create_flow(new_flow(payment_document())).await.unwrap();

    service.start_transaction("order-2", &flow.id, payment_params()).await.unwrap();
    service.drain().await;

    let again = service
        .start_transaction("order-2", &flow.id, json!({"something": "else"}))
        .await
        .unwrap();
    assert!(again.replayed);
    assert_eq!(again.status, InstanceStatus::Success);

    service.drain().await;
    assert_eq!(rpc.call_count(), 1);
    assert_eq!(h.repos.tasks.list_by_group("order-2").await.unwrap().len(), 2);
}

#[tokio::test]
async fn start_rejects_bad_requests() {
    let h = harness(vec![], enforce());
    let service = service(&h);

    let err = service.start_transaction("order-3", "missing", json!({})).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::NotFound);

    let mut flow = service.create_flow(new_flow(payment_document())).await.unwrap();
    let err = service
        .start_transaction("order-3", &flow.id, json!([1, 2]))
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::BadRequest);

    let err = service.start_transaction(" ", &flow.id, json!({})).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::BadRequest);

    flow.active = false;
    h.repos.flows.update(&flow).await.unwrap();
    let err = service.start_transaction("order-3", &flow.id, json!({})).await.unwrap_err();
    assert!(matches!(err, ServiceError::BadRequest(ref m) if m.contains("not active")));
    assert!(h.repos.instances.get("order-3").await.unwrap().is_none());
}

#[tokio::test]
async fn create_flow_validates_the_document() {
    let h = harness(vec![], enforce());
    let service = service(&h);

    let mut unnamed = new_flow(payment_document());
    unnamed.name = String::new();
    assert!(matches!(service.create_flow(unnamed).await, Err(ServiceError::BadRequest(_))));

    let err = service.create_flow(new_flow(json!("{not json"))).await.unwrap_err();
    assert!(matches!(err, ServiceError::Definition(DefinitionError::Malformed(_))));

    let cyclic = json!({"name": "c", "tasks": [
        {"id": "a", "task_name": "deduct", "depends_on": ["b"]},
        {"id": "b", "task_name": "notify", "depends_on": ["a"]}
    ]});
    let err = service.create_flow(new_flow(cyclic)).await.unwrap_err();
    assert!(matches!(err, ServiceError::Definition(DefinitionError::CyclicDependency)));

    let unknown = json!({"name": "u", "tasks": [{"id": "a", "task_name": "refund"}]});
    let err = service.create_flow(new_flow(unknown)).await.unwrap_err();
    assert!(matches!(err, ServiceError::Definition(DefinitionError::UnknownTask(ref n)) if n == "refund"));
    assert_eq!(err.class(), ErrorClass::BadRequest);

    // JSON text is accepted as well as an object
    let text = payment_document().to_string();
    let flow = service.create_flow(new_flow(json!(text))).await.unwrap();
    assert_eq!(service.get_flow(&flow.id).await.unwrap().name, "payment");
    assert_eq!(service.list_flows(None, None).await.unwrap().total, 1);
}

#[tokio::test]
async fn default_mode_accepts_cycles_but_not_duplicates_or_long_intervals() {
    let h = harness(vec![], ignore_dependencies());
    let service = service(&h);

    let cyclic = json!({"name": "c", "tasks": [
        {"id": "a", "task_name": "deduct", "depends_on": ["b"]},
        {"id": "b", "task_name": "notify", "depends_on": ["a", "ghost"]}
    ]});
    service.create_flow(new_flow(cyclic)).await.unwrap();

    let duplicate = json!({"name": "d", "tasks": [
        {"id": "a", "task_name": "deduct"},
        {"id": "a", "task_name": "notify"}
    ]});
    let err = service.create_flow(new_flow(duplicate)).await.unwrap_err();
    assert!(matches!(err, ServiceError::Definition(DefinitionError::DuplicateNode(ref n)) if n == "a"));

    let long = json!({"name": "l", "tasks": [
        {"id": "a", "task_name": "deduct", "retry": {"strategy": "auto", "interval": 10_000_000_000_000u64}}
    ]});
    let err = service.create_flow(new_flow(long)).await.unwrap_err();
    assert!(matches!(err, ServiceError::Definition(DefinitionError::RetryInterval { ref node, .. }) if node == "a"));
    assert_eq!(err.class(), ErrorClass::BadRequest);
}

#[tokio::test]
async fn concurrent_retries_claim_the_instance_once() {
    let rpc = ScriptedExecutor::failing_times("rpc", 1);
    let h = harness(vec![rpc.clone(), ScriptedExecutor::ok("mq")], enforce());
    let service = service(&h);
    let flow = service.create_flow(new_flow(payment_document())).await.unwrap();

    service.start_transaction("order-7", &flow.id, payment_params()).await.unwrap();
    service.drain().await;

    let (first, second) = tokio::join!(
        service.retry_transaction("order-7"),
        service.retry_transaction("order-7")
    );
    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let err = results.into_iter().find_map(Result::err).unwrap();
    assert_eq!(err.class(), ErrorClass::BadRequest);

    service.drain().await;
    let view = service.get_transaction("order-7").await.unwrap();
    assert_eq!(view.instance.status, InstanceStatus::Success);
    assert_eq!(view.instance.attempt, 2);
    assert_eq!(rpc.call_count(), 2);
}

#[tokio::test]
async fn start_is_not_blocked_while_draining() {
    let h = harness(
        vec![ScriptedExecutor::slow("rpc", Duration::from_millis(800)), ScriptedExecutor::ok("mq")],
        enforce(),
    );
    let service = Arc::new(service(&h));
    let flow = service.create_flow(new_flow(payment_document())).await.unwrap();
    service.start_transaction("order-8", &flow.id, payment_params()).await.unwrap();

    let draining = {
        let service = service.clone();
        tokio::spawn(async move { service.drain().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(
        Duration::from_millis(300),
        service.start_transaction("order-9", &flow.id, payment_params()),
    )
    .await
    .expect("start must not wait for the drain")
    .unwrap();

    draining.await.unwrap();
    for id in ["order-8", "order-9"] {
        let view = service.get_transaction(id).await.unwrap();
        assert_eq!(view.instance.status, InstanceStatus::Success, "{id}");
    }
}

#[tokio::test]
async fn retry_transaction_reruns_with_fresh_task_ids() {
    let rpc = ScriptedExecutor::failing_times("rpc", 1);
    let h = harness(vec![rpc.clone(), ScriptedExecutor::ok("mq")], enforce());
    let service = service(&h);
    let flow = service.create_flow(new_flow(payment_document())).await.unwrap();

    service.start_transaction("order-4", &flow.id, payment_params()).await.unwrap();
    service.drain().await;
    assert_eq!(
        service.get_transaction("order-4").await.unwrap().instance.status,
        InstanceStatus::Failed
    );

    let outcome = service.retry_transaction("order-4").await.unwrap();
    assert_eq!(outcome.status, InstanceStatus::Pending);
    service.drain().await;

    let view = service.get_transaction("order-4").await.unwrap();
    assert_eq!(view.instance.status, InstanceStatus::Success);
    assert_eq!(view.instance.attempt, 2);
    let ids: Vec<_> = view.tasks.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["order-4_t1", "order-4_t1_a2", "order-4_t2_a2"]);
    assert_eq!(view.tasks[0].status, TaskStatus::Failed);

    // The retry used the stored params
    assert_eq!(rpc.calls()[1].input, rpc.calls()[0].input);

    let err = service.retry_transaction("order-4").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::BadRequest);
}

#[tokio::test]
async fn exceptions_are_handled_once() {
    let h = harness(vec![ScriptedExecutor::failing("rpc"), ScriptedExecutor::ok("mq")], enforce());
    let service = service(&h);
    let flow = service.create_flow(new_flow(payment_document())).await.unwrap();
    service.start_transaction("order-5", &flow.id, payment_params()).await.unwrap();
    service.drain().await;

    let open = service.list_exceptions(None, None, Some(false)).await.unwrap();
    assert_eq!(open.total, 1);
    let id = open.list[0].id;
    assert_eq!(open.list[0].retry_strategy, RetryStrategy::Manual);

    let scheduled = service.schedule_exception_retry(id).await.unwrap();
    assert!(scheduled.retry_next_at.is_some());

    let handled = service
        .handle_exception(id, None, Some("refunded by hand".to_string()))
        .await
        .unwrap();
    assert!(handled.handled);
    assert_eq!(handled.handled_by.as_deref(), Some("system"));
    assert!(handled.handled_at.is_some());

    let err = service.handle_exception(id, Some("ops".to_string()), None).await.unwrap_err();
    assert!(matches!(err, ServiceError::BadRequest(_)));
    let err = service.schedule_exception_retry(id).await.unwrap_err();
    assert!(matches!(err, ServiceError::BadRequest(_)));

    assert_eq!(service.list_exceptions(None, None, Some(true)).await.unwrap().total, 1);
    assert_eq!(service.list_exceptions(None, None, Some(false)).await.unwrap().total, 0);

    let err = service.handle_exception(999, None, None).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::NotFound);
}

#[tokio::test]
async fn shutdown_cancels_running_flows() {
    let h = harness(
        vec![ScriptedExecutor::slow("rpc", Duration::from_secs(30)), ScriptedExecutor::ok("mq")],
        enforce(),
    );
    let service = service(&h);
    let flow = service.create_flow(new_flow(payment_document())).await.unwrap();
    service.start_transaction("order-6", &flow.id, payment_params()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    tokio::time::timeout(Duration::from_secs(5), service.shutdown())
        .await
        .expect("shutdown should not wait for the slow executor");

    let view = service.get_transaction("order-6").await.unwrap();
    assert_eq!(view.instance.status, InstanceStatus::Failed);
    assert!(view.tasks[0].error_message.as_deref().unwrap().contains("Cancelled"));
}

#[tokio::test]
async fn flows_list_is_paged() {
    let h = harness(vec![], enforce());
    let service = service(&h);
    for _ in 0..5 {
        service.create_flow(new_flow(payment_document())).await.unwrap();
    }

    let page = service.list_flows(Some(2), Some(2)).await.unwrap();
    assert_eq!((page.page, page.page_size, page.total), (2, 2, 5));
    assert_eq!(page.list.len(), 2);

    let last = service.list_flows(Some(3), Some(2)).await.unwrap();
    assert_eq!(last.list.len(), 1);

    let clamped = service.list_flows(Some(0), Some(1000)).await.unwrap();
    assert_eq!((clamped.page, clamped.page_size), (1, 100));
}
