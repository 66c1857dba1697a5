//! End-to-end lifecycle tests for the provider facade, using the in-memory
//! store and a scripted engine runner.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use tf_broker::engine::mocks::FakeRunner;
use tf_broker::{
    BrokerError, CancelToken, ExecutionState, InstanceState, MemoryStore, ServiceDefinition,
    StateStore, TeardownOutcome, TemplateDefinition, TfProvider, VarContext, WorkspaceId,
};

fn service_definition() -> ServiceDefinition {
    ServiceDefinition {
        name: "example-db".to_string(),
        provision_settings: TemplateDefinition {
            name: "provision-settings".to_string(),
            body: "resource \"sql_db\" \"main\" {\n  size = \"{{ size }}\"\n}\n".to_string(),
            required: vec!["size".to_string()],
        },
        bind_settings: TemplateDefinition {
            name: "bind-settings".to_string(),
            body: "resource \"sql_user\" \"binding\" {\n  host = \"{{ endpoint }}\"\n}\n"
                .to_string(),
            required: vec!["endpoint".to_string()],
        },
    }
}

fn provider_with(store: Arc<MemoryStore>, runner: Arc<FakeRunner>) -> TfProvider {
    TfProvider::new(
        store,
        runner,
        service_definition(),
        Duration::from_millis(5),
        Duration::from_secs(2),
    )
}

fn provision_outputs() -> BTreeMap<String, serde_json::Value> {
    let mut outputs = BTreeMap::new();
    outputs.insert("endpoint".to_string(), json!("db.example.com"));
    outputs
}

#[tokio::test]
async fn provision_outputs_become_bind_variables() {
    let store = Arc::new(MemoryStore::new());
    let runner = Arc::new(FakeRunner::succeeding_with_outputs(provision_outputs()));
    let provider = provider_with(store.clone(), runner);

    let outputs = provider
        .provision(
            "i1",
            &VarContext::builder().set("size", "small").build(),
            CancelToken::noop(),
        )
        .await
        .unwrap();
    assert_eq!(outputs.get("endpoint"), Some(&json!("db.example.com")));

    // Bind must see the provision output in its variable context; the
    // rendered binding workspace proves it was substituted.
    provider
        .bind("i1", "b1", &VarContext::default(), CancelToken::noop())
        .await
        .unwrap();

    let binding_workspace = store
        .load_workspace(&WorkspaceId::for_binding("i1", "b1"))
        .await
        .unwrap()
        .expect("binding workspace rendered");
    assert!(binding_workspace
        .rendered_config
        .contains("host = \"db.example.com\""));
}

#[tokio::test]
async fn bind_against_unprovisioned_instance_is_refused() {
    let store = Arc::new(MemoryStore::new());
    let runner = Arc::new(FakeRunner::succeeding());
    let provider = provider_with(store, runner);

    let err = provider
        .bind("ghost", "b1", &VarContext::default(), CancelToken::noop())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Dispatch { .. }));
}

#[tokio::test]
async fn failed_deprovision_leaves_instance_provisioned() {
    let store = Arc::new(MemoryStore::new());

    {
        let runner = Arc::new(FakeRunner::succeeding_with_outputs(provision_outputs()));
        let provider = provider_with(store.clone(), runner);
        provider
            .provision(
                "i1",
                &VarContext::builder().set("size", "small").build(),
                CancelToken::noop(),
            )
            .await
            .unwrap();
    }

    let runner = Arc::new(FakeRunner::failing(vec![
        "Error: instance still has attached disks".to_string(),
    ]));
    let provider = provider_with(store.clone(), runner);
    let err = provider
        .deprovision("i1", CancelToken::noop())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::ProvisioningFailure { .. }));

    let instance = store.load_instance("i1").await.unwrap().unwrap();
    assert_eq!(instance.state, InstanceState::Provisioned);
    assert!(instance.last_failure.is_some());
    // The captured outputs survive the failed teardown for the retry.
    assert_eq!(instance.outputs.get("endpoint"), Some(&json!("db.example.com")));
}

#[tokio::test]
async fn unbind_twice_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let runner = Arc::new(FakeRunner::succeeding_with_outputs(provision_outputs()));
    let provider = provider_with(store.clone(), runner);

    provider
        .provision(
            "i1",
            &VarContext::builder().set("size", "small").build(),
            CancelToken::noop(),
        )
        .await
        .unwrap();
    provider
        .bind("i1", "b1", &VarContext::default(), CancelToken::noop())
        .await
        .unwrap();

    assert_eq!(
        provider
            .unbind("i1", "b1", CancelToken::noop())
            .await
            .unwrap(),
        TeardownOutcome::Destroyed
    );
    assert_eq!(
        provider
            .unbind("i1", "b1", CancelToken::noop())
            .await
            .unwrap(),
        TeardownOutcome::AlreadyGone
    );

    // A binding that never existed behaves the same way.
    assert_eq!(
        provider
            .unbind("i1", "b2", CancelToken::noop())
            .await
            .unwrap(),
        TeardownOutcome::AlreadyGone
    );
}

#[tokio::test]
async fn deprovision_of_unknown_instance_is_a_noop() {
    let store = Arc::new(MemoryStore::new());
    let runner = Arc::new(FakeRunner::succeeding());
    let provider = provider_with(store.clone(), runner);

    assert_eq!(
        provider
            .deprovision("never-provisioned", CancelToken::noop())
            .await
            .unwrap(),
        TeardownOutcome::AlreadyGone
    );
    assert!(store
        .load_execution(&WorkspaceId::for_instance("never-provisioned"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn second_operation_on_same_instance_is_refused_while_first_runs() {
    let store = Arc::new(MemoryStore::new());
    let runner = Arc::new(FakeRunner::succeeding().hold());
    let provider = Arc::new(provider_with(store.clone(), runner.clone()));

    let first = {
        let provider = Arc::clone(&provider);
        tokio::spawn(async move {
            provider
                .provision(
                    "i1",
                    &VarContext::builder().set("size", "small").build(),
                    CancelToken::noop(),
                )
                .await
        })
    };

    // Give the first dispatch time to win the conditional insert.
    let mut dispatched = false;
    for _ in 0..100 {
        if store
            .load_execution(&WorkspaceId::for_instance("i1"))
            .await
            .unwrap()
            .is_some()
        {
            dispatched = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(dispatched, "first provision never dispatched");

    let err = provider
        .provision(
            "i1",
            &VarContext::builder().set("size", "large").build(),
            CancelToken::noop(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::ConcurrentOperation { .. }));

    runner.release();
    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn timed_out_wait_can_be_observed_later_through_status() {
    let store = Arc::new(MemoryStore::new());
    let runner = Arc::new(FakeRunner::succeeding_with_outputs(provision_outputs()).hold());

    // Tight timeout so the wait gives up while the run is still in flight.
    let provider = TfProvider::new(
        store.clone(),
        runner.clone(),
        service_definition(),
        Duration::from_millis(5),
        Duration::from_millis(30),
    );

    let err = provider
        .provision(
            "i1",
            &VarContext::builder().set("size", "small").build(),
            CancelToken::noop(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::WaitTimeout { .. }));

    // The timeout did not advance the lifecycle.
    let instance = store.load_instance("i1").await.unwrap().unwrap();
    assert_eq!(instance.state, InstanceState::Provisioning);

    // The remote run finishes out-of-band; status observes its outcome.
    runner.release();
    for _ in 0..100 {
        if let Some(execution) = provider.status("i1", None).await.unwrap() {
            if execution.state.is_terminal() {
                assert_eq!(execution.state, ExecutionState::Succeeded);
                assert_eq!(execution.outputs.get("endpoint"), Some(&json!("db.example.com")));
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("run never reached a terminal state after release");
}

#[tokio::test]
async fn provision_with_missing_required_variable_fails_fast() {
    let store = Arc::new(MemoryStore::new());
    let runner = Arc::new(FakeRunner::succeeding());
    let provider = provider_with(store.clone(), runner);

    let err = provider
        .provision("i1", &VarContext::default(), CancelToken::noop())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::MissingVariables { .. }));

    // Nothing was dispatched for the failed render.
    assert!(store
        .load_execution(&WorkspaceId::for_instance("i1"))
        .await
        .unwrap()
        .is_none());
}
