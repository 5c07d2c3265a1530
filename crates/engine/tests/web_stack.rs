use std::sync::Arc;
use std::time::Duration;

use strata_engine::executor::ApplyOptions;
use strata_engine::provider::{ProviderError, ProviderOperation, SimulatedProvider};
use strata_engine::state::StateStoreError;
use strata_engine::{
    EngineError, Executor, JsonStateStore, ResolveInputs, ResolvedTemplate, RetryPolicy, StateStore, TemplateError, parse_template, resolve_template,
};
use strata_types::{ProvisioningStatus, ResourceAction, RunStatus};
use tokio_util::sync::CancellationToken;

fn load_fixture(stack_name: &str) -> ResolvedTemplate {
    let text = include_str!("data/web_stack.yaml");
    let template = parse_template(text).expect("parse web stack fixture");
    resolve_template(&template, &ResolveInputs::new(stack_name)).expect("resolve web stack fixture")
}

fn options(max_concurrency: usize) -> ApplyOptions {
    ApplyOptions {
        max_concurrency,
        retry: RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 1,
            multiplier: 2.0,
            max_delay_ms: 8,
        },
        ..ApplyOptions::default()
    }
}

fn position(order: &[String], logical_id: &str) -> usize {
    order
        .iter()
        .position(|entry| entry == logical_id)
        .unwrap_or_else(|| panic!("{logical_id} missing from {order:?}"))
}

#[tokio::test]
async fn web_stack_is_created_in_dependency_order() {
    let resolved = load_fixture("web");
    let provider = Arc::new(SimulatedProvider::default().with_latency(Duration::from_millis(2)));
    let temp_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonStateStore::new(temp_dir.path().to_path_buf()));
    let report = Executor::new(provider.clone(), store.clone())
        .with_options(options(4))
        .apply(&resolved, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded, "{}", report.summary());
    assert_eq!(report.summary(), "16 created");
    let order = provider.call_order(ProviderOperation::Create);
    for (prerequisite, dependent) in resolved.graph.edges() {
        assert!(
            position(&order, &prerequisite) < position(&order, &dependent),
            "{prerequisite} must be created before {dependent}"
        );
    }

    let dns = report.outputs["LoadBalancerDns"].as_str().unwrap().to_string();
    assert!(dns.ends_with(".us-east-1.elb.amazonaws.com"), "{dns}");
    assert_eq!(report.outputs["WebUrl"], serde_json::json!(format!("http://{dns}/")));
    assert_eq!(report.outputs["InstanceIps"].as_str().unwrap().split(',').count(), 2);

    let state = store.load("web").unwrap().unwrap();
    assert_eq!(state.live_resources().count(), 16);
    assert_eq!(state.parameters["AdminPassword"], serde_json::json!("****"));
    assert!(state.exports.contains_key("web-VpcId"));
    assert!(temp_dir.path().join("web.json").exists());

    let listener = state.record("Listener").unwrap();
    let target_group_arn = &state.record("TargetGroup").unwrap().physical_id;
    assert_eq!(listener.properties["DefaultActions"][0]["TargetGroupArn"], serde_json::json!(target_group_arn));
}

#[tokio::test]
async fn reapplying_an_unchanged_stack_makes_no_provider_calls() {
    let resolved = load_fixture("web");
    let provider = Arc::new(SimulatedProvider::default());
    let temp_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonStateStore::new(temp_dir.path().to_path_buf()));
    let executor = Executor::new(provider.clone(), store.clone()).with_options(options(4));

    executor.apply(&resolved, CancellationToken::new()).await.unwrap();
    let calls = provider.call_counts().total();

    let report = executor.apply(&load_fixture("web"), CancellationToken::new()).await.unwrap();
    assert_eq!(report.summary(), "16 unchanged");
    assert_eq!(provider.call_counts().total(), calls);
    assert_eq!(store.load("web").unwrap().unwrap().generation, 2);
}

#[tokio::test]
async fn a_failed_instance_blocks_only_its_dependents() {
    let resolved = load_fixture("web");
    let provider = Arc::new(SimulatedProvider::default());
    provider.fail_next(
        "WebInstanceA",
        ProviderOperation::Create,
        ProviderError::fatal("InsufficientInstanceCapacity", "no t3.micro capacity in us-east-1a"),
    );
    let store = Arc::new(strata_engine::InMemoryStateStore::new());
    let report = Executor::new(provider.clone(), store.clone())
        .with_options(options(4))
        .apply(&resolved, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.outcome("WebInstanceA").unwrap().status, ProvisioningStatus::Failed);
    for blocked in ["TargetGroup", "Listener"] {
        assert_eq!(report.outcome(blocked).unwrap().action, ResourceAction::Skip, "{blocked}");
    }
    for independent in ["WebInstanceB", "LoadBalancer", "DefaultRoute"] {
        assert_eq!(report.outcome(independent).unwrap().status, ProvisioningStatus::Created, "{independent}");
    }
    assert!(provider.call_order(ProviderOperation::Create).iter().all(|id| id != "Listener"));
    assert!(report.outputs.is_empty());

    let message = report.ensure_success().unwrap_err().to_string();
    assert!(message.contains("WebInstanceA"), "{message}");
    assert!(message.contains("2 skipped"), "{message}");

    // The next apply only creates what is missing.
    let report = Executor::new(provider.clone(), store.clone())
        .with_options(options(4))
        .apply(&load_fixture("web"), CancellationToken::new())
        .await
        .unwrap();
    assert!(report.succeeded());
    assert_eq!(report.with_action(ResourceAction::Create), vec!["WebInstanceA", "TargetGroup", "Listener"]);
}

#[tokio::test]
async fn concurrency_never_exceeds_the_configured_bound() {
    for max_concurrency in [1, 3] {
        let provider = Arc::new(SimulatedProvider::default().with_latency(Duration::from_millis(5)));
        let store = Arc::new(strata_engine::InMemoryStateStore::new());
        let report = Executor::new(provider.clone(), store)
            .with_options(options(max_concurrency))
            .apply(&load_fixture("web"), CancellationToken::new())
            .await
            .unwrap();
        assert!(report.succeeded());
        assert!(provider.max_in_flight() <= max_concurrency, "{} > {max_concurrency}", provider.max_in_flight());
        if max_concurrency > 1 {
            assert!(provider.max_in_flight() > 1, "independent resources should overlap");
        }
    }
}

#[tokio::test]
async fn throttled_calls_are_retried_transparently() {
    let provider = Arc::new(SimulatedProvider::default());
    provider.throttle("LoadBalancer", ProviderOperation::Create, 3);
    let store = Arc::new(strata_engine::InMemoryStateStore::new());
    let report = Executor::new(provider.clone(), store)
        .with_options(options(4))
        .apply(&load_fixture("web"), CancellationToken::new())
        .await
        .unwrap();

    assert!(report.succeeded());
    assert_eq!(report.outcome("LoadBalancer").unwrap().attempts, 4);
    assert_eq!(provider.call_counts().create, 16 + 3);
}

#[test]
fn cyclic_templates_are_rejected_during_resolution() {
    let text = r#"
Resources:
  First:
    Type: AWS::EC2::SecurityGroup
    Properties:
      GroupDescription: first
      VpcId: !GetAtt Second.VpcId
  Second:
    Type: AWS::EC2::SecurityGroup
    DependsOn: First
    Properties:
      GroupDescription: second
"#;
    let template = parse_template(text).unwrap();
    let error = resolve_template(&template, &ResolveInputs::new("web")).unwrap_err();
    match error {
        TemplateError::CyclicDependency { members } => {
            assert_eq!(members.first(), members.last());
            assert!(members.contains(&"First".to_string()) && members.contains(&"Second".to_string()));
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
}

#[tokio::test]
async fn destroy_removes_everything_in_reverse_order() {
    let resolved = load_fixture("web");
    let provider = Arc::new(SimulatedProvider::default());
    let temp_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonStateStore::new(temp_dir.path().to_path_buf()));
    let executor = Executor::new(provider.clone(), store.clone()).with_options(options(4));
    executor.apply(&resolved, CancellationToken::new()).await.unwrap();

    let report = executor.destroy("web", CancellationToken::new()).await.unwrap();
    assert!(report.succeeded(), "{}", report.summary());
    assert_eq!(report.summary(), "16 deleted");

    let order = provider.call_order(ProviderOperation::Delete);
    for (prerequisite, dependent) in resolved.graph.edges() {
        assert!(
            position(&order, &dependent) < position(&order, &prerequisite),
            "{dependent} must be deleted before {prerequisite}"
        );
    }
    assert_eq!(provider.resource_count(), 0);
    assert!(store.load("web").unwrap().is_none());
    assert!(store.list_stacks().unwrap().is_empty());
}

#[tokio::test]
async fn state_survives_a_new_executor_and_store_instance() {
    let temp_dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(SimulatedProvider::default());
    {
        let store = Arc::new(JsonStateStore::new(temp_dir.path().to_path_buf()));
        Executor::new(provider.clone(), store)
            .with_options(options(4))
            .apply(&load_fixture("web"), CancellationToken::new())
            .await
            .unwrap();
    }

    let store = Arc::new(JsonStateStore::new(temp_dir.path().to_path_buf()));
    let report = Executor::new(provider.clone(), store)
        .with_options(options(4))
        .apply(&load_fixture("web"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.with_action(ResourceAction::Noop).len(), 16);
}

#[tokio::test]
async fn unreadable_state_stops_apply_and_destroy_before_any_call() {
    let temp_dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(SimulatedProvider::default());
    let store = Arc::new(JsonStateStore::new(temp_dir.path().to_path_buf()));
    let executor = Executor::new(provider.clone(), store.clone()).with_options(options(4));
    executor.apply(&load_fixture("web"), CancellationToken::new()).await.unwrap();
    let calls = provider.call_counts().total();

    let path = store.stack_path("web");
    let drifted = std::fs::read_to_string(&path).unwrap().replace("\"created\"", "\"provisioned\"");
    std::fs::write(&path, &drifted).unwrap();

    let error = executor.apply(&load_fixture("web"), CancellationToken::new()).await.unwrap_err();
    assert!(matches!(error, EngineError::State(StateStoreError::Serialization(_))), "{error}");
    let error = executor.destroy("web", CancellationToken::new()).await.unwrap_err();
    assert!(matches!(error, EngineError::State(StateStoreError::Serialization(_))), "{error}");

    assert_eq!(provider.call_counts().total(), calls);
    assert_eq!(provider.resource_count(), 16);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), drifted);
}
