//! Retry-on-conflict behavior: a concurrent writer bumps the live
//! resourceVersion between preview and apply; the update is retried only
//! when the recomputed diff digest still matches the approved one.

mod common;

use std::sync::Arc;
use std::time::Duration;

use berth_apply::{ApplyError, ApplyOpts, ClusterChangeSet};
use berth_config::ConfigBundle;
use berth_core::{Path, Resource};
use berth_diff::{Change, ChangeFactory, ChangeOp, ResourceWithHistory};
use berth_graph::ChangeGraph;
use common::FakeCluster;
use serde_json::json;
use tokio::sync::watch;

fn service(port: u64) -> Resource {
    Resource::from_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {"name": "redis-master", "namespace": "default"},
        "spec": {"ports": [{"port": port}], "selector": {"app": "redis"}}
    }))
    .unwrap()
}

fn fast_opts() -> ApplyOpts {
    ApplyOpts {
        backoff_base: Duration::from_millis(1),
        wait_poll: Duration::from_millis(10),
        wait_timeout: Duration::from_secs(2),
        global_timeout: Duration::from_secs(5),
        ..ApplyOpts::default()
    }
}

/// Seeds the fake with a resource that looks like the outcome of an earlier
/// deploy: history annotations recorded for `applied`.
fn seed_deployed(fake: &FakeCluster, factory: &ChangeFactory, applied: &Resource) -> Resource {
    let recorded = ResourceWithHistory::new(applied, factory).record_last_applied(applied).unwrap();
    fake.seed(recorded);
    fake.stored(&applied.id()).unwrap()
}

fn update_change(factory: &ChangeFactory, live: &Resource, desired: &Resource) -> Change {
    let change = factory.new_change(Some(live), Some(desired)).unwrap();
    assert_eq!(change.op(), ChangeOp::Update);
    change
}

async fn run(
    factory: &ChangeFactory,
    client: Arc<FakeCluster>,
    change: Change,
) -> Result<berth_apply::ApplySummary, ApplyError> {
    let changes = vec![change];
    let graph = ChangeGraph::build(&changes, &[], &[]).unwrap();
    let set = ClusterChangeSet::new(
        changes,
        graph,
        client,
        Arc::new(factory.clone()),
        fast_opts(),
    );
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    set.apply(cancel_rx).await
}

#[tokio::test]
async fn net_zero_concurrent_change_is_retried_transparently() {
    let factory = ChangeFactory::new(ConfigBundle::default(), false);
    let fake = Arc::new(FakeCluster::new());
    let live = seed_deployed(&fake, &factory, &service(6380));

    // A third party touches the resource (bumping resourceVersion) but ends
    // at the same content.
    let same_content = fake.stored(&live.id()).unwrap();
    fake.queue_conflict(same_content);

    let change = update_change(&factory, &live, &service(6381));
    let summary = run(&factory, fake.clone(), change).await.unwrap();

    assert_eq!(summary.updated, 1);
    assert_eq!(summary.failed, 0);
    let updates = fake.calls().iter().filter(|c| c.starts_with("update")).count();
    assert_eq!(updates, 2, "conflicted update plus one retry");
    let stored = fake.stored(&live.id()).unwrap();
    assert_eq!(
        stored.get(&Path::from_keys(&["spec", "ports"])).unwrap()[0]["port"],
        json!(6381)
    );
}

#[tokio::test]
async fn real_concurrent_change_fails_with_resource_conflict() {
    let factory = ChangeFactory::new(ConfigBundle::default(), false);
    let fake = Arc::new(FakeCluster::new());
    let live = seed_deployed(&fake, &factory, &service(6380));

    // The third party leaves a different selector behind.
    let mut mutated = fake.stored(&live.id()).unwrap();
    mutated
        .set(&Path::from_keys(&["spec", "selector", "changed"]), json!("label"))
        .unwrap();
    fake.queue_conflict(mutated);

    let change = update_change(&factory, &live, &service(6381));
    let err = run(&factory, fake.clone(), change).await.unwrap_err();

    let ApplyError::Composite { failures, summary } = err else {
        panic!("expected composite failure")
    };
    assert_eq!(summary.failed, 1);
    assert_eq!(failures.len(), 1);
    let message = &failures[0].1;
    assert!(
        message.contains("approved diff no longer matches"),
        "message: {}",
        message
    );
    assert!(
        message.contains("please apply your changes to the latest version and try again (reason: Conflict)"),
        "message: {}",
        message
    );
}

#[tokio::test]
async fn conflict_rebased_away_by_user_rule_succeeds() {
    // Same concurrent selector change, but the config carries a rebase rule
    // copying spec.selector from existing; the recomputed diff digest then
    // matches the approved one.
    let config_doc = Resource::from_value(
        serde_json::to_value(
            serde_yaml::from_str::<serde_yaml::Value>(
                r#"
apiVersion: berth.dev/v1alpha1
kind: Config
metadata: {name: selector-rebase}
rebaseRules:
- path: [spec, selector]
  type: copy
  sources: [existing]
  resourceMatchers:
  - allResourceMatcher: {}
"#,
            )
            .unwrap(),
        )
        .unwrap(),
    )
    .unwrap();
    let (_, bundle) = ConfigBundle::from_resources(vec![config_doc]).unwrap();
    let factory = ChangeFactory::new(bundle, false);

    let fake = Arc::new(FakeCluster::new());
    let live = seed_deployed(&fake, &factory, &service(6380));

    let mut mutated = fake.stored(&live.id()).unwrap();
    mutated
        .set(&Path::from_keys(&["spec", "selector", "changed"]), json!("label"))
        .unwrap();
    fake.queue_conflict(mutated);

    let change = update_change(&factory, &live, &service(6381));
    let summary = run(&factory, fake.clone(), change).await.unwrap();

    assert_eq!(summary.updated, 1);
    let stored = fake.stored(&live.id()).unwrap();
    // The rebased selector (including the third party's label) survived.
    assert_eq!(
        stored.get(&Path::from_keys(&["spec", "selector", "changed"])),
        Some(&json!("label"))
    );
    assert_eq!(
        stored.get(&Path::from_keys(&["spec", "ports"])).unwrap()[0]["port"],
        json!(6381)
    );
}

#[tokio::test]
async fn retries_are_bounded() {
    let factory = ChangeFactory::new(ConfigBundle::default(), false);
    let fake = Arc::new(FakeCluster::new());
    let live = seed_deployed(&fake, &factory, &service(6380));

    // More net-zero conflicts than the retry budget allows.
    for _ in 0..8 {
        fake.queue_conflict(fake.stored(&live.id()).unwrap());
    }

    let change = update_change(&factory, &live, &service(6381));
    let err = run(&factory, fake.clone(), change).await.unwrap_err();
    let ApplyError::Composite { failures, .. } = err else { panic!("expected composite") };
    assert!(failures[0].1.contains("reason: Conflict"), "message: {}", failures[0].1);
    let updates = fake.calls().iter().filter(|c| c.starts_with("update")).count();
    assert_eq!(updates, 1 + fast_opts().conflict_retries as usize);
}
