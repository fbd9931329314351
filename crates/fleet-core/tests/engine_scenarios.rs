//! End-to-end runs of the engine against the in-memory store and the sim
//! driver.

use fleet_core::action::{Action, ActionFilter, ActionStatus};
use fleet_core::cluster::{Cluster, ClusterStatus, Node, NodeStatus, Profile, ProvisionStep};
use fleet_core::config::EngineConfig;
use fleet_core::driver::sim::SimEvent;
use fleet_core::driver::{DriverRegistry, SimDriver};
use fleet_core::engine::{Engine, Submission};
use fleet_core::policy::{
    Adjustment, HealthSpec, LoadBalanceSpec, PlacementSpec, PolicySpec, ScalingSpec,
};
use fleet_core::store::Store;
use fleet_core::types::{ActionKind, Cause, ResourceType};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const IDLE: Duration = Duration::from_secs(20);

fn fast_config() -> EngineConfig {
    EngineConfig {
        workers: 4,
        default_action_timeout_secs: 30,
        lock_retry_limit: 50,
        lock_retry_base_ms: 2,
        lock_retry_max_ms: 20,
        lock_lease_secs: 5,
        reclaim_interval_secs: 1,
        driver_retry_limit: 3,
        driver_retry_base_ms: 1,
        readiness_timeout_secs: 1,
        readiness_poll_ms: 5,
        max_members_per_cluster: 100,
    }
}

fn profile(steps: &[&str]) -> Profile {
    Profile {
        steps: steps
            .iter()
            .map(|s| ProvisionStep {
                name: s.to_string(),
                driver: "sim".into(),
                spec: Map::new(),
            })
            .collect(),
    }
}

fn inputs(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap()
}

struct Fleet {
    engine: Engine,
    sim: Arc<SimDriver>,
}

fn fleet() -> Fleet {
    fleet_with(fast_config())
}

fn fleet_with(config: EngineConfig) -> Fleet {
    let sim = Arc::new(SimDriver::default());
    let drivers = DriverRegistry::new().with(sim.clone());
    Fleet {
        engine: Engine::new(Store::memory(), drivers, config),
        sim,
    }
}

impl Fleet {
    async fn settle(&self) {
        self.engine.run_until_idle(IDLE).await.unwrap();
    }

    fn get(&self, id: Uuid) -> Action {
        self.engine.get(id).unwrap()
    }

    fn cluster_record(&self, id: &str) -> Cluster {
        self.engine.store().cluster(id).unwrap()
    }

    fn nodes(&self, cluster_id: &str) -> Vec<Node> {
        self.engine.store().cluster_nodes(cluster_id).unwrap()
    }

    async fn cluster(&self, name: &str, steps: &[&str], desired: u32) -> Cluster {
        let (cluster, create) = self
            .engine
            .create_cluster(name, profile(steps), 0, None, desired)
            .unwrap();
        self.settle().await;
        assert_eq!(self.get(create).status, ActionStatus::Succeeded);
        self.cluster_record(&cluster.id)
    }

    async fn attach(&self, cluster: &Cluster, name: &str, spec: PolicySpec) {
        self.engine.create_policy(name, spec).unwrap();
        let id = self
            .engine
            .submit(
                ActionKind::ClusterAttachPolicy,
                &cluster.id,
                inputs(json!({ "policy": name })),
            )
            .unwrap();
        self.settle().await;
        assert_eq!(self.get(id).status, ActionStatus::Succeeded);
    }
}

#[tokio::test]
async fn scale_out_adds_active_nodes() {
    let f = fleet();
    let c = f.cluster("web", &["server"], 2).await;

    let id = f
        .engine
        .submit(ActionKind::ClusterScaleOut, &c.id, inputs(json!({ "count": 3 })))
        .unwrap();
    f.settle().await;

    let action = f.get(id);
    assert_eq!(action.status, ActionStatus::Succeeded);
    assert_eq!(action.depends_on.len(), 3);
    let cluster = f.cluster_record(&c.id);
    assert_eq!(cluster.desired_capacity, 5);
    assert_eq!(cluster.status, ClusterStatus::Active);
    let nodes = f.nodes(&c.id);
    assert_eq!(nodes.len(), 5);
    assert!(nodes
        .iter()
        .all(|n| n.status == NodeStatus::Active && n.resources.len() == 1));
    assert_eq!(f.sim.live_resources().len(), 5);
}

#[tokio::test]
async fn failed_child_rolls_back_and_fails_parent() {
    let f = fleet();
    let c = f.cluster("web", &["server", "disk"], 2).await;
    f.sim.fail_step("disk", 1);

    let id = f
        .engine
        .submit(ActionKind::ClusterScaleOut, &c.id, inputs(json!({ "count": 3 })))
        .unwrap();
    f.settle().await;

    let action = f.get(id);
    assert_eq!(action.status, ActionStatus::Failed);
    assert_eq!(action.outputs["failed"].as_array().unwrap().len(), 1);
    let cluster = f.cluster_record(&c.id);
    assert_eq!(cluster.desired_capacity, 4);
    assert_eq!(cluster.status, ClusterStatus::Warning);
    let nodes = f.nodes(&c.id);
    assert_eq!(nodes.len(), 4);
    assert!(nodes.iter().all(|n| n.status == NodeStatus::Active));
    // Two resources per surviving node and nothing left from the failed one.
    assert_eq!(f.sim.live_resources().len(), 8);
}

#[tokio::test]
async fn policy_abort_fails_without_touching_backends() {
    let f = fleet();
    let c = f.cluster("web", &["server"], 2).await;
    f.attach(
        &c,
        "cap",
        PolicySpec::Scaling(ScalingSpec {
            min_size: 0,
            max_size: Some(3),
            adjustment: Adjustment::default(),
        }),
    )
    .await;
    let calls = f.sim.provision_calls();

    let id = f
        .engine
        .submit(ActionKind::ClusterScaleOut, &c.id, inputs(json!({ "count": 2 })))
        .unwrap();
    let action = f.get(id);
    assert_eq!(action.status, ActionStatus::Failed);
    assert!(action
        .status_reason
        .contains("Attempted scaling exceeds maximum size"));
    f.settle().await;

    assert_eq!(f.sim.provision_calls(), calls);
    assert_eq!(f.cluster_record(&c.id).desired_capacity, 2);
    let children = f
        .engine
        .list(&ActionFilter {
            parent: Some(id),
            ..ActionFilter::default()
        })
        .unwrap();
    assert!(children.is_empty());
}

#[tokio::test]
async fn capacity_violation_fails_the_action() {
    let f = fleet();
    let (c, _) = f
        .engine
        .create_cluster("web", profile(&["server"]), 1, Some(2), 1)
        .unwrap();
    f.settle().await;

    let grow = f
        .engine
        .submit(ActionKind::ClusterScaleOut, &c.id, inputs(json!({ "count": 2 })))
        .unwrap();
    assert_eq!(f.get(grow).status, ActionStatus::Failed);
    assert!(f
        .get(grow)
        .status_reason
        .contains("Attempted scaling exceeds maximum size"));

    let shrink = f
        .engine
        .submit(ActionKind::ClusterScaleIn, &c.id, inputs(json!({ "count": 1 })))
        .unwrap();
    assert_eq!(f.get(shrink).status, ActionStatus::Failed);
    assert!(f
        .get(shrink)
        .status_reason
        .contains("Attempted scaling exceeds minimum size"));
    assert_eq!(f.cluster_record(&c.id).desired_capacity, 1);
}

#[tokio::test]
async fn concurrent_priority_updates_serialize_on_the_cluster_lock() {
    let f = fleet();
    let c = f.cluster("web", &["server"], 0).await;
    f.attach(&c, "spread", PolicySpec::Placement(PlacementSpec { zones: vec!["az1".into()] }))
        .await;
    f.attach(&c, "hc", PolicySpec::Health(HealthSpec::default()))
        .await;

    let a = f
        .engine
        .submit(
            ActionKind::ClusterUpdatePolicy,
            &c.id,
            inputs(json!({ "policy": "spread", "priority": 70 })),
        )
        .unwrap();
    let b = f
        .engine
        .submit(
            ActionKind::ClusterUpdatePolicy,
            &c.id,
            inputs(json!({ "policy": "hc", "priority": 70 })),
        )
        .unwrap();
    f.settle().await;

    let mut statuses = vec![f.get(a).status, f.get(b).status];
    statuses.sort_by_key(|s| s.to_string());
    assert_eq!(statuses, [ActionStatus::Failed, ActionStatus::Succeeded]);
    let loser = if f.get(a).status == ActionStatus::Failed { a } else { b };
    assert!(f.get(loser).status_reason.contains("already used"));

    let bindings = f.engine.store().bindings(&c.id).unwrap();
    assert_eq!(bindings.len(), 2);
    assert_ne!(bindings[0].priority, bindings[1].priority);
}

#[tokio::test]
async fn cancel_before_start_never_provisions() {
    let f = fleet();
    let c = f.cluster("web", &["server"], 2).await;
    let calls = f.sim.provision_calls();

    let id = f
        .engine
        .submit(ActionKind::ClusterScaleOut, &c.id, inputs(json!({ "count": 2 })))
        .unwrap();
    let cancelled = f.engine.cancel(id).unwrap();
    assert_eq!(cancelled.status, ActionStatus::Cancelled);
    f.settle().await;

    assert_eq!(f.sim.provision_calls(), calls);
    for child in &cancelled.depends_on {
        assert_eq!(f.get(*child).status, ActionStatus::Cancelled);
    }
    assert_eq!(f.cluster_record(&c.id).desired_capacity, 2);
    assert_eq!(f.nodes(&c.id).len(), 2);
}

#[tokio::test]
async fn cancel_while_running_unwinds_the_node() {
    let f = fleet();
    let c = f.cluster("web", &["server", "disk"], 1).await;
    let live_before = f.sim.live_resources();
    f.sim.slow_step("server", Duration::from_millis(300));
    let calls = f.sim.provision_calls();

    let handle = f.engine.start().unwrap();
    let id = f
        .engine
        .submit(ActionKind::ClusterScaleOut, &c.id, inputs(json!({ "count": 1 })))
        .unwrap();
    while f.sim.provision_calls() == calls {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    f.engine.cancel(id).unwrap();
    let done = f.engine.wait_for(id, IDLE).await.unwrap();
    handle.shutdown().await;

    assert_eq!(done.status, ActionStatus::Cancelled);
    assert_eq!(f.get(done.depends_on[0]).status, ActionStatus::Cancelled);
    assert_eq!(f.sim.live_resources(), live_before);
    assert_eq!(f.cluster_record(&c.id).desired_capacity, 1);
    assert_eq!(f.nodes(&c.id).len(), 1);
}

#[tokio::test]
async fn timeout_rolls_back_partial_work() {
    let f = fleet();
    let c = f.cluster("web", &["server", "disk"], 1).await;
    let live_before = f.sim.live_resources();
    f.sim.slow_step("disk", Duration::from_secs(3));

    let id = f
        .engine
        .submit_request(
            Submission::new(ActionKind::ClusterScaleOut, &c.id)
                .input("count", 1)
                .timeout_secs(1),
        )
        .unwrap();
    f.settle().await;

    let action = f.get(id);
    assert_eq!(action.status, ActionStatus::Failed);
    assert_eq!(f.get(action.depends_on[0]).status, ActionStatus::Timeout);
    assert_eq!(f.sim.live_resources(), live_before);
    assert_eq!(f.nodes(&c.id).len(), 1);
}

#[tokio::test]
async fn orphaned_actions_are_requeued_or_failed() {
    let f = fleet();
    let c = f.cluster("web", &["server"], 2).await;
    let nodes = f.nodes(&c.id);
    let store = f.engine.store();

    let stranded = |kind: ActionKind, node: &Node| {
        let mut a = Action::new(kind, &node.id, Map::new(), Cause::User, 60);
        a.transition(ActionStatus::Ready, "").unwrap();
        a.transition(ActionStatus::Running, "").unwrap();
        a.owner = Some("dead-engine".into());
        store.insert_action(&a).unwrap();
        f.engine
            .locks()
            .try_acquire(ResourceType::Node, &node.id, a.id, "dead-engine", Duration::ZERO)
            .unwrap();
        a.id
    };
    let delete = stranded(ActionKind::NodeDelete, &nodes[0]);
    let recover = stranded(ActionKind::NodeRecover, &nodes[1]);

    let report = f.engine.reclaim().unwrap();
    assert_eq!(report.requeued, [delete]);
    assert_eq!(report.failed, [recover]);
    assert_eq!(f.get(delete).status, ActionStatus::Ready);
    let failed = f.get(recover);
    assert_eq!(failed.status, ActionStatus::Failed);
    assert!(failed.status_reason.contains("orphaned"));

    f.settle().await;
    assert_eq!(f.get(delete).status, ActionStatus::Succeeded);
    assert!(store.find_node(&nodes[0].id).unwrap().is_none());
    assert_eq!(f.cluster_record(&c.id).desired_capacity, 1);
}

#[tokio::test]
async fn replacement_is_up_before_the_old_node_goes() {
    let f = fleet();
    let c = f.cluster("web", &["server"], 2).await;
    let old = f.nodes(&c.id)[0].clone();
    let old_resource = old.resources[0].resource_id.clone();
    let base = f.sim.events().len();

    let id = f
        .engine
        .submit(
            ActionKind::ClusterReplaceNodes,
            &c.id,
            inputs(json!({ "nodes": [old.id] })),
        )
        .unwrap();
    f.settle().await;

    assert_eq!(f.get(id).status, ActionStatus::Succeeded);
    let events = f.sim.events()[base..].to_vec();
    let provisioned = events
        .iter()
        .position(|e| matches!(e, SimEvent::Provisioned { .. }))
        .unwrap();
    let removed = events
        .iter()
        .position(|e| matches!(e, SimEvent::Deprovisioned { id, .. } if *id == old_resource))
        .unwrap();
    assert!(provisioned < removed);

    let nodes = f.nodes(&c.id);
    assert_eq!(nodes.len(), 2);
    assert!(nodes.iter().all(|n| n.id != old.id));
    assert_eq!(f.cluster_record(&c.id).desired_capacity, 2);
}

#[tokio::test]
async fn failed_health_check_triggers_recovery() {
    let f = fleet();
    let c = f.cluster("web", &["server"], 2).await;
    f.attach(&c, "hc", PolicySpec::Health(HealthSpec::default()))
        .await;
    let sick = f.nodes(&c.id)[0].clone();
    let sick_resource = sick.resources[0].resource_id.clone();
    f.sim.set_healthy(&sick_resource, false);

    let check = f
        .engine
        .submit(ActionKind::ClusterCheck, &c.id, Map::new())
        .unwrap();
    f.settle().await;

    let check = f.get(check);
    assert_eq!(check.status, ActionStatus::Succeeded);
    assert_eq!(check.outputs["unhealthy"], json!([sick.id]));

    let recovers = f
        .engine
        .list(&ActionFilter {
            kind: Some(ActionKind::ClusterRecover),
            ..ActionFilter::default()
        })
        .unwrap();
    assert_eq!(recovers.len(), 1);
    assert_eq!(recovers[0].cause, Cause::Derived);
    assert_eq!(recovers[0].status, ActionStatus::Succeeded);

    let healed = f.engine.store().node(&sick.id).unwrap();
    assert_eq!(healed.status, NodeStatus::Active);
    assert_ne!(healed.resources[0].resource_id, sick_resource);
    assert!(!f.sim.live_resources().contains(&sick_resource));
    assert_eq!(f.cluster_record(&c.id).status, ClusterStatus::Active);
}

#[tokio::test]
async fn placement_and_load_balancer_shape_new_nodes() {
    let f = fleet();
    let c = f.cluster("web", &["server"], 0).await;
    f.attach(
        &c,
        "spread",
        PolicySpec::Placement(PlacementSpec {
            zones: vec!["az1".into(), "az2".into()],
        }),
    )
    .await;
    f.attach(
        &c,
        "front",
        PolicySpec::LoadBalance(LoadBalanceSpec {
            driver: "sim".into(),
            pool: "web-pool".into(),
            port: 8080,
        }),
    )
    .await;

    let id = f
        .engine
        .submit(ActionKind::ClusterScaleOut, &c.id, inputs(json!({ "count": 3 })))
        .unwrap();
    f.settle().await;
    assert_eq!(f.get(id).status, ActionStatus::Succeeded);

    let nodes = f.nodes(&c.id);
    let in_zone = |z: &str| nodes.iter().filter(|n| n.zone.as_deref() == Some(z)).count();
    assert_eq!(in_zone("az1"), 2);
    assert_eq!(in_zone("az2"), 1);
    for node in &nodes {
        let steps: Vec<&str> = node.resources.iter().map(|r| r.step.as_str()).collect();
        assert_eq!(steps, ["server", "lb_member"]);
    }
}

#[tokio::test]
async fn delete_tears_everything_down() {
    let f = fleet();
    let c = f.cluster("web", &["server", "disk"], 3).await;
    f.attach(&c, "hc", PolicySpec::Health(HealthSpec::default()))
        .await;

    let id = f
        .engine
        .submit(ActionKind::ClusterDelete, &c.id, Map::new())
        .unwrap();
    f.settle().await;

    assert_eq!(f.get(id).status, ActionStatus::Succeeded);
    let cluster = f.cluster_record(&c.id);
    assert_eq!(cluster.status, ClusterStatus::Deleted);
    assert!(f.nodes(&c.id).is_empty());
    assert!(f.sim.live_resources().is_empty());
    assert!(f.engine.store().bindings(&c.id).unwrap().is_empty());
    assert!(f
        .engine
        .submit(ActionKind::ClusterScaleOut, &c.id, Map::new())
        .is_err());
}

#[tokio::test]
async fn back_to_back_scale_ins_remove_distinct_nodes() {
    let f = fleet();
    let c = f.cluster("web", &["server"], 3).await;

    let a = f
        .engine
        .submit(ActionKind::ClusterScaleIn, &c.id, inputs(json!({ "count": 1 })))
        .unwrap();
    let b = f
        .engine
        .submit(ActionKind::ClusterScaleIn, &c.id, inputs(json!({ "count": 1 })))
        .unwrap();
    let victim_a = f.get(f.get(a).depends_on[0]).target;
    let victim_b = f.get(f.get(b).depends_on[0]).target;
    assert_ne!(victim_a, victim_b);
    f.settle().await;

    assert_eq!(f.get(a).status, ActionStatus::Succeeded);
    assert_eq!(f.get(b).status, ActionStatus::Succeeded);
    let nodes = f.nodes(&c.id);
    assert_eq!(nodes.len(), 1);
    assert_eq!(f.cluster_record(&c.id).desired_capacity, 1);
    assert_eq!(f.sim.live_resources().len(), 1);
}

#[tokio::test]
async fn refused_removal_hands_its_nodes_back() {
    let f = fleet();
    let (c, _) = f
        .engine
        .create_cluster("web", profile(&["server"]), 2, None, 2)
        .unwrap();
    f.settle().await;

    let id = f
        .engine
        .submit(ActionKind::ClusterScaleIn, &c.id, inputs(json!({ "count": 1 })))
        .unwrap();
    assert_eq!(f.get(id).status, ActionStatus::Failed);
    assert!(f
        .nodes(&c.id)
        .iter()
        .all(|n| n.status == NodeStatus::Active));
}

#[tokio::test]
async fn failed_resize_keeps_the_old_bounds() {
    let f = fleet();
    let c = f.cluster("web", &["server"], 2).await;

    let id = f
        .engine
        .submit(
            ActionKind::ClusterResize,
            &c.id,
            inputs(json!({
                "adjustment_type": "EXACT_CAPACITY",
                "number": 200,
                "min_size": 1,
                "max_size": 500,
            })),
        )
        .unwrap();
    let action = f.get(id);
    assert_eq!(action.status, ActionStatus::Failed);
    assert!(action.status_reason.contains("limit of 100"), "{}", action.status_reason);
    let after = f.cluster_record(&c.id);
    assert_eq!((after.min_size, after.max_size), (0, None));
    assert_eq!(after.desired_capacity, 2);

    let id = f
        .engine
        .submit(
            ActionKind::ClusterResize,
            &c.id,
            inputs(json!({ "adjustment_type": "EXACT_CAPACITY", "number": 3, "max_size": 4 })),
        )
        .unwrap();
    f.settle().await;
    assert_eq!(f.get(id).status, ActionStatus::Succeeded);
    let after = f.cluster_record(&c.id);
    assert_eq!((after.max_size, after.desired_capacity), (Some(4), 3));
}

#[tokio::test]
async fn lock_held_elsewhere_fails_after_the_retry_budget() {
    let f = fleet_with(EngineConfig {
        lock_retry_limit: 2,
        ..fast_config()
    });
    let c = f.cluster("web", &["server"], 1).await;
    let node = f.nodes(&c.id)[0].clone();
    let outsider = Uuid::new_v4();
    assert!(f
        .engine
        .locks()
        .try_acquire(ResourceType::Node, &node.id, outsider, "elsewhere", Duration::from_secs(60))
        .unwrap());

    let id = f
        .engine
        .submit(ActionKind::NodeCheck, &node.id, Map::new())
        .unwrap();
    f.settle().await;

    let action = f.get(id);
    assert_eq!(action.status, ActionStatus::Failed);
    assert!(action.status_reason.contains("is locked by"), "{}", action.status_reason);
    assert!(action.status_reason.contains(&outsider.to_string()));
    assert_eq!(action.lock_attempts, 3);
    assert_eq!(
        f.engine
            .locks()
            .holder(ResourceType::Node, &node.id)
            .unwrap()
            .unwrap()
            .holder_action,
        outsider
    );
}

#[tokio::test]
async fn finished_actions_never_hold_their_lock() {
    let f = fleet();
    let c = f.cluster("web", &["server"], 1).await;
    let node = f.nodes(&c.id)[0].clone();
    f.sim.slow_step("server", Duration::from_millis(20));

    let handle = f.engine.start().unwrap();
    let ids: Vec<Uuid> = (0..4)
        .map(|_| {
            f.engine
                .submit(ActionKind::NodeRecover, &node.id, Map::new())
                .unwrap()
        })
        .collect();
    let mut finished = 0;
    while finished < ids.len() {
        finished = 0;
        for id in &ids {
            if f.get(*id).is_terminal() {
                finished += 1;
                let holder = f.engine.locks().holder(ResourceType::Node, &node.id).unwrap();
                assert_ne!(holder.map(|h| h.holder_action), Some(*id));
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    handle.shutdown().await;
    assert!(ids.iter().all(|id| f.get(*id).status == ActionStatus::Succeeded));
    assert!(f.engine.locks().list().unwrap().is_empty());
}

#[tokio::test]
async fn restart_reports_results_that_were_never_fanned_in() {
    let f = fleet();
    let c = f.cluster("web", &["server"], 2).await;
    let store = f.engine.store().clone();

    let check = f
        .engine
        .submit(ActionKind::ClusterCheck, &c.id, Map::new())
        .unwrap();
    let children = f.get(check).depends_on;
    // The first child finished, but its process stopped before telling the
    // parent.
    store
        .update_action(children[0], |a| {
            a.transition(ActionStatus::Running, "")?;
            a.transition(ActionStatus::Succeeded, "")
        })
        .unwrap();

    let drivers = DriverRegistry::new().with(f.sim.clone());
    let restarted = Engine::new(store, drivers, fast_config());
    restarted.run_until_idle(IDLE).await.unwrap();

    let parent = restarted.get(check).unwrap();
    assert_eq!(parent.status, ActionStatus::Succeeded, "{}", parent.status_reason);
    assert_eq!(parent.pending, 0);
    assert!(children
        .iter()
        .all(|id| restarted.get(*id).unwrap().status == ActionStatus::Succeeded));
}

#[tokio::test]
async fn restart_resumes_actions_left_in_init() {
    let f = fleet();
    let c = f.cluster("web", &["server"], 1).await;
    let node = f.nodes(&c.id)[0].clone();
    let store = f.engine.store();
    let long_ago = chrono::Utc::now() - chrono::Duration::hours(1);

    let mut leaf = Action::new(ActionKind::NodeCheck, &node.id, Map::new(), Cause::User, 60);
    leaf.updated_at = long_ago;
    store.insert_action(&leaf).unwrap();
    let mut compound = Action::new(ActionKind::ClusterScaleOut, &c.id, Map::new(), Cause::User, 60);
    compound.updated_at = long_ago;
    store.insert_action(&compound).unwrap();
    let fresh = Action::new(ActionKind::NodeCheck, &node.id, Map::new(), Cause::User, 60);
    store.insert_action(&fresh).unwrap();

    f.settle().await;

    assert_eq!(f.get(leaf.id).status, ActionStatus::Succeeded);
    let compound = f.get(compound.id);
    assert_eq!(compound.status, ActionStatus::Failed);
    assert!(compound.status_reason.contains("interrupted"));
    // Still inside its submitter's lease.
    assert_eq!(f.get(fresh.id).status, ActionStatus::Init);
}

#[tokio::test]
async fn update_timing_out_on_old_resources_keeps_the_new_ones() {
    let f = fleet();
    let c = f.cluster("web", &["server"], 1).await;
    let old = f.nodes(&c.id)[0].clone();
    f.sim.slow_teardown("server", Duration::from_secs(3));

    let id = f
        .engine
        .submit_request(
            Submission::new(ActionKind::ClusterUpdate, &c.id)
                .input("profile", serde_json::to_value(profile(&["vm"])).unwrap())
                .timeout_secs(1),
        )
        .unwrap();
    f.settle().await;

    let parent = f.get(id);
    assert!(parent.is_terminal() && parent.status != ActionStatus::Succeeded);
    assert_eq!(f.get(parent.depends_on[0]).status, ActionStatus::Timeout);

    let node = f.engine.store().node(&old.id).unwrap();
    assert_eq!(node.status, NodeStatus::Error);
    assert!(node.status_reason.contains("replaced"), "{}", node.status_reason);
    let steps: Vec<&str> = node.resources.iter().map(|r| r.step.as_str()).collect();
    assert_eq!(steps, ["server", "vm"]);
    let live = f.sim.live_resources();
    assert!(node.resources.iter().all(|r| live.contains(&r.resource_id)));
}
