mod common;

use common::*;
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use txcore::{
    DefinitionError, ExecutorError, FailureKind, FlowDefinition, FlowError, FlowTask, Instance,
    InstanceStatus, LogAction, RetryOverride, RetryStrategy, TaskDefinition, TaskError,
    TaskStatus, Value, MAX_RETRY_INTERVAL_SECS,
};
use txruntime::{EngineConfig, TaskRegistry};

fn payment_flow() -> FlowDefinition {
    let mut def = FlowDefinition::new("payment");
    def.add_task(FlowTask::new("t1", "deduct"))
        .add_task(FlowTask::new("t2", "notify"));
    def
}

async fn start(h: &Harness, def: &FlowDefinition, id: &str, params: serde_json::Value) -> (Instance, Result<(), FlowError>) {
    let flow = save_flow(&h.repos, def).await;
    let mut instance = Instance::new(id, &flow.id, params.clone());
    h.repos.instances.create(&instance).await.unwrap();
    let result = h
        .engine
        .execute(&CancellationToken::new(), &mut instance, &flow, &common::params(params))
        .await;
    (instance, result)
}

#[tokio::test]
async fn all_nodes_succeed() {
    let rpc = ScriptedExecutor::ok("rpc");
    let mq = ScriptedExecutor::ok("mq");
    let h = harness(vec![rpc.clone(), mq.clone()], enforce());

    let (instance, result) = start(&h, &payment_flow(), "order-1", payment_params()).await;
    result.unwrap();

    let stored = h.repos.instances.get("order-1").await.unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::Success);
    assert!(stored.completed_at.is_some());
    assert_eq!(instance.status, InstanceStatus::Success);

    let tasks = h.repos.tasks.list_by_group("order-1").await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Success && t.completed_at.is_some()));
    assert!(tasks.iter().any(|t| t.id == "order-1_t1" && t.name == "deduct"));

    let call = &rpc.calls()[0];
    assert_eq!(call.input.get("amount"), Some(&Value::Int(100)));
    assert_eq!(call.config.get("service"), Some(&json!("PaymentService")));
    assert_eq!(mq.calls()[0].config.get("topic"), Some(&json!("payment.completed")));

    let (exceptions, total) = h.repos.exceptions.list(0, 10, None).await.unwrap();
    assert_eq!(total, 0, "{exceptions:?}");

    let actions: Vec<_> = h
        .repos
        .logs
        .list_by_task("order-1_t1")
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.action)
        .collect();
    assert_eq!(actions, vec![LogAction::Start, LogAction::Success]);
}

#[tokio::test]
async fn validation_failure_fails_instance_and_records_only_that_node() {
    let rpc = ScriptedExecutor::ok("rpc");
    let mq = ScriptedExecutor::ok("mq");
    let h = harness(vec![rpc.clone(), mq.clone()], ignore_dependencies());

    let params = json!({
        "deduct": {"amount": 100, "order_id": "o1"},
        "notify": {"user_id": "u1", "order_id": "o1", "status": "paid"}
    });
    let (_, result) = start(&h, &payment_flow(), "order-2", params).await;

    let err = result.unwrap_err();
    let failures = err.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].node_id, "t1");
    assert!(matches!(&failures[0].error, TaskError::Validation(v) if v.field == "user_id"));

    let stored = h.repos.instances.get("order-2").await.unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::Failed);
    assert!(stored.completed_at.is_none());

    assert_eq!(rpc.call_count(), 0, "validation failure must not reach the executor");
    assert_eq!(mq.call_count(), 1);

    let (exceptions, _) = h.repos.exceptions.list(0, 10, None).await.unwrap();
    assert_eq!(exceptions.len(), 1);
    assert_eq!(exceptions[0].task_id, "order-2_t1");
    assert_eq!(exceptions[0].task_name, "deduct");
    assert_eq!(exceptions[0].error_kind, FailureKind::Validation);

    let t1 = h.repos.tasks.get("order-2_t1").await.unwrap().unwrap();
    assert_eq!(t1.status, TaskStatus::Failed);
    assert!(t1.error_message.unwrap().contains("user_id"));
    let t2 = h.repos.tasks.get("order-2_t2").await.unwrap().unwrap();
    assert_eq!(t2.status, TaskStatus::Success);
}

#[tokio::test]
async fn malformed_definition_aborts_before_touching_instance() {
    let h = harness(vec![], enforce());
    let mut flow = save_flow(&h.repos, &payment_flow()).await;
    flow.definition = "{\"tasks\": [".to_string();

    let mut instance = Instance::new("order-3", &flow.id, json!({}));
    h.repos.instances.create(&instance).await.unwrap();

    let err = h
        .engine
        .execute(&CancellationToken::new(), &mut instance, &flow, &Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Definition(DefinitionError::Malformed(_))));

    let stored = h.repos.instances.get("order-3").await.unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::Pending);
    assert!(h.repos.tasks.list_by_group("order-3").await.unwrap().is_empty());
}

#[tokio::test]
async fn every_failure_is_returned_in_document_order() {
    let h = harness(
        vec![ScriptedExecutor::failing("rpc"), ScriptedExecutor::failing("mq")],
        ignore_dependencies(),
    );

    let (_, result) = start(&h, &payment_flow(), "order-4", payment_params()).await;
    let err = result.unwrap_err();
    let nodes: Vec<_> = err.failures().iter().map(|f| f.node_id.as_str()).collect();
    assert_eq!(nodes, vec!["t1", "t2"]);
    assert!(err.to_string().starts_with("2 task(s) failed"));

    let (_, total) = h.repos.exceptions.list(0, 10, None).await.unwrap();
    assert_eq!(total, 2);
}

#[tokio::test]
async fn dependent_of_failed_node_is_skipped() {
    let mq = ScriptedExecutor::ok("mq");
    let h = harness(vec![ScriptedExecutor::failing("rpc"), mq.clone()], enforce());

    let mut def = FlowDefinition::new("chained");
    def.add_task(FlowTask::new("t1", "deduct"))
        .add_task(FlowTask::new("t2", "notify").depends_on("t1"));

    let (_, result) = start(&h, &def, "order-5", payment_params()).await;
    let err = result.unwrap_err();
    assert_eq!(err.failures().len(), 1);

    assert_eq!(mq.call_count(), 0);
    assert!(h.repos.tasks.get("order-5_t2").await.unwrap().is_none());
    let (_, total) = h.repos.exceptions.list(0, 10, None).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(
        h.repos.instances.get("order-5").await.unwrap().unwrap().status,
        InstanceStatus::Failed
    );
}

#[tokio::test]
async fn dependents_start_after_predecessor_completes() {
    let h = harness(
        vec![ScriptedExecutor::slow("rpc", Duration::from_millis(50)), ScriptedExecutor::ok("mq")],
        enforce(),
    );

    let mut def = FlowDefinition::new("ordered");
    def.add_task(FlowTask::new("t2", "notify").depends_on("t1"))
        .add_task(FlowTask::new("t1", "deduct"));

    let (_, result) = start(&h, &def, "order-6", payment_params()).await;
    result.unwrap();

    let t1 = h.repos.tasks.get("order-6_t1").await.unwrap().unwrap();
    let t2 = h.repos.tasks.get("order-6_t2").await.unwrap().unwrap();
    assert!(t2.started_at.unwrap() >= t1.completed_at.unwrap());
}

#[tokio::test]
async fn ignore_mode_runs_dependents_regardless() {
    let mq = ScriptedExecutor::ok("mq");
    let h = harness(vec![ScriptedExecutor::failing("rpc"), mq.clone()], ignore_dependencies());

    let mut def = FlowDefinition::new("chained");
    def.add_task(FlowTask::new("t1", "deduct"))
        .add_task(FlowTask::new("t2", "notify").depends_on("t1"));

    let (_, result) = start(&h, &def, "order-7", payment_params()).await;
    assert!(result.is_err());
    assert_eq!(mq.call_count(), 1);
    assert_eq!(
        h.repos.tasks.get("order-7_t2").await.unwrap().unwrap().status,
        TaskStatus::Success
    );
}

#[tokio::test]
async fn cyclic_dependencies_are_rejected_only_when_enforced() {
    let mut def = FlowDefinition::new("cycle");
    def.add_task(FlowTask::new("t1", "deduct").depends_on("t2"))
        .add_task(FlowTask::new("t2", "notify").depends_on("t1"));

    let h = harness(vec![], enforce());
    let (_, result) = start(&h, &def, "order-8", json!({})).await;
    assert!(matches!(result, Err(FlowError::Definition(DefinitionError::CyclicDependency))));

    let rpc = ScriptedExecutor::ok("rpc");
    let mq = ScriptedExecutor::ok("mq");
    let h = harness(vec![rpc.clone(), mq.clone()], ignore_dependencies());
    let (instance, result) = start(&h, &def, "order-8", payment_params()).await;
    result.unwrap();
    assert_eq!(instance.status, InstanceStatus::Success);
    assert_eq!((rpc.call_count(), mq.call_count()), (1, 1));
}

#[tokio::test]
async fn default_config_runs_dependents_of_failed_nodes() {
    let mq = ScriptedExecutor::ok("mq");
    let h = harness(vec![ScriptedExecutor::failing("rpc"), mq.clone()], EngineConfig::default());

    let mut def = FlowDefinition::new("chained");
    def.add_task(FlowTask::new("t1", "deduct"))
        .add_task(FlowTask::new("t2", "notify").depends_on("t1").depends_on("ghost"));

    let (_, result) = start(&h, &def, "order-12", payment_params()).await;
    assert_eq!(result.unwrap_err().failures().len(), 1);
    assert_eq!(mq.call_count(), 1);
}

#[tokio::test]
async fn duplicate_node_ids_are_rejected_in_default_mode() {
    let h = harness(vec![ScriptedExecutor::ok("rpc")], EngineConfig::default());
    let mut def = FlowDefinition::new("dup");
    def.add_task(FlowTask::new("t1", "deduct"))
        .add_task(FlowTask::new("t1", "notify"));

    let (_, result) = start(&h, &def, "order-13", payment_params()).await;
    assert!(matches!(
        result,
        Err(FlowError::Definition(DefinitionError::DuplicateNode(ref id))) if id == "t1"
    ));
}

#[tokio::test]
async fn oversized_retry_interval_records_one_clamped_exception() {
    let h = harness(vec![ScriptedExecutor::failing("rpc")], ignore_dependencies());
    let mut def = FlowDefinition::new("long-wait");
    def.add_task(FlowTask::new("t1", "deduct").with_retry(RetryOverride::auto(3, 10_000_000_000_000)));

    let (_, result) = start(&h, &def, "order-14", payment_params()).await;
    assert_eq!(result.unwrap_err().failures().len(), 1);

    let (records, total) = h.repos.exceptions.list(0, 10, None).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(records[0].retry_interval, MAX_RETRY_INTERVAL_SECS);
    assert!(records[0].retry_next_at.unwrap() > records[0].occurred_at);
}

#[tokio::test]
async fn exception_snapshots_effective_retry_policy() {
    let h = harness(
        vec![ScriptedExecutor::failing("rpc"), ScriptedExecutor::failing("mq")],
        ignore_dependencies(),
    );

    let mut def = FlowDefinition::new("policy");
    def.add_task(FlowTask::new("t1", "deduct").with_retry(RetryOverride::auto(5, 30)))
        .add_task(FlowTask::new("t2", "notify"));

    let (_, result) = start(&h, &def, "order-9", payment_params()).await;
    assert!(result.is_err());

    let (records, _) = h.repos.exceptions.list(0, 10, None).await.unwrap();
    let t1 = records.iter().find(|r| r.task_id == "order-9_t1").unwrap();
    assert_eq!(t1.retry_strategy, RetryStrategy::Auto);
    assert_eq!((t1.retry_max, t1.retry_interval, t1.retry_times), (5, 30, 0));
    let delay = t1.retry_next_at.unwrap() - t1.occurred_at;
    assert!((29..=31).contains(&delay.num_seconds()));
    assert_eq!(t1.group_name, "policy");
    assert_eq!(t1.error_kind, FailureKind::Execution);

    let t2 = records.iter().find(|r| r.task_id == "order-9_t2").unwrap();
    assert_eq!(t2.retry_strategy, RetryStrategy::Manual);
    assert_eq!((t2.retry_max, t2.retry_interval), (3, 60));

    let task = h.repos.tasks.get("order-9_t1").await.unwrap().unwrap();
    assert_eq!(task.max_retry, 5);
}

#[tokio::test]
async fn unknown_task_name_fails_without_task_row() {
    let h = harness(vec![ScriptedExecutor::ok("rpc")], enforce());
    let mut def = FlowDefinition::new("unknown");
    def.add_task(FlowTask::new("t1", "refund"));

    let (_, result) = start(&h, &def, "order-10", json!({})).await;
    let err = result.unwrap_err();
    assert!(matches!(
        &err.failures()[0].error,
        TaskError::Definition(DefinitionError::UnknownTask(name)) if name == "refund"
    ));
    assert!(h.repos.tasks.list_by_group("order-10").await.unwrap().is_empty());
    let (_, total) = h.repos.exceptions.list(0, 10, None).await.unwrap();
    assert_eq!(total, 0);
}

#[tokio::test]
async fn unsupported_type_fails_after_task_row_exists() {
    let h = harness(vec![ScriptedExecutor::ok("rpc")], enforce());
    let mut def = FlowDefinition::new("no-broker");
    def.add_task(FlowTask::new("t1", "notify"));

    let (_, result) = start(&h, &def, "order-11", payment_params()).await;
    let err = result.unwrap_err();
    assert!(matches!(
        &err.failures()[0].error,
        TaskError::Definition(DefinitionError::UnsupportedType(t)) if t == "mq"
    ));

    let task = h.repos.tasks.get("order-11_t1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    let (records, _) = h.repos.exceptions.list(0, 10, None).await.unwrap();
    assert_eq!(records[0].error_kind, FailureKind::Definition);
}

#[tokio::test]
async fn node_config_overrides_definition_defaults() {
    let rpc = ScriptedExecutor::ok("rpc");
    let h = harness(vec![rpc.clone()], enforce());
    let mut def = FlowDefinition::new("override");
    def.add_task(FlowTask::new("t1", "deduct").with_config("method", "refund").with_config("timeout", 5));

    let (_, result) = start(&h, &def, "order-12", payment_params()).await;
    result.unwrap();

    let config = &rpc.calls()[0].config;
    assert_eq!(config.get("service"), Some(&json!("PaymentService")));
    assert_eq!(config.get("method"), Some(&json!("refund")));
    assert_eq!(config.get("timeout"), Some(&json!(5)));
}

#[tokio::test]
async fn schema_less_definition_receives_global_params() {
    let http = ScriptedExecutor::ok("http");
    let mut registry = TaskRegistry::with_builtins();
    registry.register(TaskDefinition::new("ping", "http"));
    let h = harness_with_registry(vec![http.clone()], enforce(), registry);

    let mut def = FlowDefinition::new("ping");
    def.add_task(FlowTask::new("t1", "ping"));
    let global = json!({"trace": "abc", "deduct": {"user_id": "u1"}});

    let (_, result) = start(&h, &def, "order-13", global.clone()).await;
    result.unwrap();
    assert_eq!(http.calls()[0].input, common::params(global));
}

#[tokio::test]
async fn cancellation_reaches_executors() {
    let h = harness(vec![ScriptedExecutor::slow("rpc", Duration::from_secs(30))], enforce());
    let mut def = FlowDefinition::new("slow");
    def.add_task(FlowTask::new("t1", "deduct"));
    let flow = save_flow(&h.repos, &def).await;

    let mut instance = Instance::new("order-14", &flow.id, payment_params());
    h.repos.instances.create(&instance).await.unwrap();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let err = h
        .engine
        .execute(&token, &mut instance, &flow, &common::params(payment_params()))
        .await
        .unwrap_err();
    assert!(matches!(&err.failures()[0].error, TaskError::Executor(ExecutorError::Cancelled)));
}

#[tokio::test]
async fn empty_flow_succeeds_immediately() {
    let h = harness(vec![], enforce());
    let (instance, result) = start(&h, &FlowDefinition::new("empty"), "order-15", json!({})).await;
    result.unwrap();
    assert_eq!(instance.status, InstanceStatus::Success);
}

#[tokio::test]
async fn retry_task_creates_new_row_with_default_config() {
    let rpc = ScriptedExecutor::failing_times("rpc", 1);
    let h = harness(vec![rpc.clone()], enforce());
    let mut def = FlowDefinition::new("retry");
    def.add_task(FlowTask::new("t1", "deduct").with_config("method", "refund"));

    let (instance, result) = start(&h, &def, "order-16", payment_params()).await;
    assert!(result.is_err());
    let flow = h.repos.flows.get("flow-retry").await.unwrap().unwrap();
    let failed = h.repos.tasks.get("order-16_t1").await.unwrap().unwrap();

    h.engine
        .retry_task(&CancellationToken::new(), &instance, &flow, &failed)
        .await
        .unwrap();

    let tasks = h.repos.tasks.list_by_group("order-16").await.unwrap();
    assert_eq!(tasks.len(), 2);
    let retried = &tasks[1];
    assert!(retried.id.starts_with("order-16_retry_"));
    assert_eq!(retried.retry_count, 1);
    assert_eq!(retried.status, TaskStatus::Success);
    assert_eq!(retried.node_id, "t1");
    assert_eq!(
        h.repos.tasks.get("order-16_t1").await.unwrap().unwrap().status,
        TaskStatus::Failed,
        "original row is left untouched"
    );

    let call = &rpc.calls()[1];
    assert!(call.input.is_empty());
    assert_eq!(call.config.get("method"), Some(&json!("deduct")));

    let actions: Vec<_> = h
        .repos
        .logs
        .list_by_task(&retried.id)
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.action)
        .collect();
    assert_eq!(actions, vec![LogAction::Retry, LogAction::Success]);

    let (_, total) = h.repos.exceptions.list(0, 10, None).await.unwrap();
    assert_eq!(total, 1, "a retry never opens a second exception record");
}

#[tokio::test]
async fn retry_task_can_reapply_node_config() {
    let rpc = ScriptedExecutor::failing_times("rpc", 1);
    let config = EngineConfig {
        retry_with_node_config: true,
        ..EngineConfig::default()
    };
    let h = harness(vec![rpc.clone()], config);
    let mut def = FlowDefinition::new("retry-node");
    def.add_task(FlowTask::new("t1", "deduct").with_config("method", "refund"));

    let (instance, _) = start(&h, &def, "order-17", payment_params()).await;
    let flow = h.repos.flows.get("flow-retry-node").await.unwrap().unwrap();
    let failed = h.repos.tasks.get("order-17_t1").await.unwrap().unwrap();

    h.engine
        .retry_task(&CancellationToken::new(), &instance, &flow, &failed)
        .await
        .unwrap();
    assert_eq!(rpc.calls()[1].config.get("method"), Some(&json!("refund")));
}
