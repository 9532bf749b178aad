//! End-to-end tests: build, wire, run and tear down whole policies

use async_trait::async_trait;
use policy_engine::{
    BlockBehavior, BlockRef, BlockTreeGenerator, EngineConfig, GroupRecord, InMemoryPolicyStore,
    MemberRecord, NullUpdateSink, SetDataConcurrency, UpdateSink,
};
use policy_types::{
    BlockDefinition, BlockEvent, BlockId, EventConfig, PolicyDocument, PolicyError, PolicyId,
    PolicyInputEvent, PolicyOutputEvent, PolicyResult, PolicyStatus, PolicyUser,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const OWNER_DID: &str = "did:example:owner";

// ── Test Doubles ─────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingSink {
    updates: Mutex<Vec<(String, Vec<BlockId>)>>,
    errors: Mutex<Vec<(String, String)>>,
}

impl RecordingSink {
    fn updates(&self) -> Vec<(String, Vec<BlockId>)> {
        self.updates.lock().unwrap().clone()
    }

    fn errors(&self) -> Vec<(String, String)> {
        self.errors.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpdateSink for RecordingSink {
    async fn block_update(&self, _policy_id: &PolicyId, user: &PolicyUser, blocks: Vec<BlockId>) {
        self.updates.lock().unwrap().push((user.id(), blocks));
    }

    async fn block_error(
        &self,
        _policy_id: &PolicyId,
        _user: &PolicyUser,
        block_type: &str,
        message: &str,
    ) {
        self.errors
            .lock()
            .unwrap()
            .push((block_type.to_string(), message.to_string()));
    }
}

/// Records every event it receives and keeps Run flowing downstream
#[derive(Default)]
struct EventLog(Mutex<Vec<String>>);

impl EventLog {
    fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

struct ProbeBehavior {
    name: String,
    log: Arc<EventLog>,
}

#[async_trait]
impl BlockBehavior for ProbeBehavior {
    fn kind(&self) -> &'static str {
        "probe"
    }

    async fn handle(&self, block: BlockRef<'_>, event: &BlockEvent) -> PolicyResult<()> {
        if event.input == PolicyInputEvent::Run {
            self.log.push(self.name.clone());
            block
                .trigger(PolicyOutputEvent::Run, &event.user, event.data.clone())
                .await;
        }
        Ok(())
    }
}

/// Exclusive behavior that holds its single-flight slot across an await
struct SlowBehavior;

#[async_trait]
impl BlockBehavior for SlowBehavior {
    fn kind(&self) -> &'static str {
        "slow"
    }

    fn concurrency(&self) -> SetDataConcurrency {
        SetDataConcurrency::Exclusive
    }

    async fn set_data(
        &self,
        _block: BlockRef<'_>,
        _user: &PolicyUser,
        _data: Value,
    ) -> PolicyResult<Value> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(json!({ "ok": true }))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn test_config() -> EngineConfig {
    EngineConfig::new().with_debounce_window(Duration::from_millis(50))
}

fn new_engine(sink: Arc<dyn UpdateSink>) -> (BlockTreeGenerator, Arc<InMemoryPolicyStore>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let store = Arc::new(InMemoryPolicyStore::new());
    let generator = BlockTreeGenerator::new(test_config(), store.clone(), sink);
    (generator, store)
}

fn register_probe(generator: &BlockTreeGenerator, log: &Arc<EventLog>) {
    let log = Arc::clone(log);
    generator.components().kinds().register(
        "probe",
        Arc::new(move |options| {
            Ok(Box::new(ProbeBehavior {
                name: options
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("probe")
                    .to_string(),
                log: Arc::clone(&log),
            }) as Box<dyn BlockBehavior>)
        }),
    );
}

fn published(config: BlockDefinition) -> PolicyDocument {
    PolicyDocument::new("Test policy", OWNER_DID, config).with_status(PolicyStatus::Published)
}

fn owner() -> PolicyUser {
    PolicyUser::new(OWNER_DID)
}

// ── Build and Registration ───────────────────────────────────────────

#[tokio::test]
async fn test_generate_registers_every_block() {
    let (generator, _) = new_engine(Arc::new(NullUpdateSink));
    let policy = published(
        BlockDefinition::new("container")
            .with_tag("root")
            .with_permissions(vec!["ANY_ROLE"])
            .with_child(
                BlockDefinition::new("info")
                    .with_tag("welcome")
                    .with_permissions(vec!["ANY_ROLE"]),
            )
            .with_child(
                BlockDefinition::new("container")
                    .with_tag("inner")
                    .with_permissions(vec!["ANY_ROLE"])
                    .with_child(
                        BlockDefinition::new("info")
                            .with_tag("details")
                            .with_permissions(vec!["ANY_ROLE"]),
                    ),
            ),
    );

    let root = generator.generate(&policy, false, None).await.unwrap();
    let components = generator.components();

    assert_eq!(components.policy_block_ids(&policy.id).len(), 4);
    assert_eq!(components.policy(&policy.id).unwrap().root, root.uuid);
    for tag in ["root", "welcome", "inner", "details"] {
        assert!(components.get_block_by_tag(&policy.id, tag).is_some());
    }
    // Pre-order: root comes first
    assert_eq!(components.policy_block_ids(&policy.id)[0], root.uuid);
}

#[tokio::test]
async fn test_generate_reuses_declared_uuid() {
    let (generator, _) = new_engine(Arc::new(NullUpdateSink));
    let mut config = BlockDefinition::new("container")
        .with_tag("root")
        .with_permissions(vec!["ANY_ROLE"]);
    config.id = Some(BlockId::new("fixed-root-id"));
    let policy = published(config);

    let root = generator.generate(&policy, false, None).await.unwrap();
    assert_eq!(root.uuid, BlockId::new("fixed-root-id"));
    assert!(generator
        .components()
        .get_block(&BlockId::new("fixed-root-id"))
        .is_some());
}

#[tokio::test]
async fn test_duplicate_tag_aborts_and_rolls_back() {
    let (generator, _) = new_engine(Arc::new(NullUpdateSink));
    let policy = published(
        BlockDefinition::new("container")
            .with_tag("root")
            .with_child(BlockDefinition::new("info").with_tag("dup"))
            .with_child(BlockDefinition::new("info").with_tag("dup")),
    );

    let mut report = policy_types::ValidationReport::new();
    let result = generator.generate(&policy, false, Some(&mut report)).await;

    assert!(result.is_none());
    assert!(!report.is_valid());
    // Nothing of the failed build survives
    let components = generator.components();
    assert!(components.policy(&policy.id).is_none());
    assert!(components.policy_block_ids(&policy.id).is_empty());
    assert!(components.get_block_by_tag(&policy.id, "root").is_none());
}

#[tokio::test]
async fn test_skip_registration_builds_without_registering() {
    let (generator, _) = new_engine(Arc::new(NullUpdateSink));
    let policy = published(BlockDefinition::new("container").with_tag("root"));

    let root = generator.generate(&policy, true, None).await.unwrap();
    assert!(generator.components().get_block(&root.uuid).is_none());
    assert!(generator.components().policy(&policy.id).is_none());
    assert_eq!(generator.components().policy_lock_count(), 0);
}

// ── Wiring ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_default_wiring_links() {
    let (generator, _) = new_engine(Arc::new(NullUpdateSink));
    let policy = published(
        BlockDefinition::new("container")
            .with_tag("root")
            .with_child(BlockDefinition::new("info").with_tag("first"))
            .with_child(BlockDefinition::new("info").with_tag("second")),
    );
    generator.generate(&policy, false, None).await.unwrap();
    let components = generator.components();

    let first = components.get_block_by_tag(&policy.id, "first").unwrap();
    let second = components.get_block_by_tag(&policy.id, "second").unwrap();
    let root = components.get_block_by_tag(&policy.id, "root").unwrap();

    let links = first.source_links();
    // Run flows to the next sibling
    assert!(links.iter().any(|l| {
        l.output == PolicyOutputEvent::Run
            && l.target == second.uuid
            && l.input == PolicyInputEvent::Run
    }));
    // Refresh bubbles to the container parent
    assert!(links.iter().any(|l| {
        l.output == PolicyOutputEvent::Refresh
            && l.target == root.uuid
            && l.input == PolicyInputEvent::Refresh
    }));
    // The last sibling has no Run link
    assert!(!second
        .source_links()
        .iter()
        .any(|l| l.output == PolicyOutputEvent::Run));
}

#[tokio::test]
async fn test_stop_propagation_suppresses_run_link() {
    let (generator, _) = new_engine(Arc::new(NullUpdateSink));
    let policy = published(
        BlockDefinition::new("container")
            .with_tag("root")
            .with_child(
                BlockDefinition::new("info")
                    .with_tag("first")
                    .with_options(json!({ "stopPropagation": true })),
            )
            .with_child(BlockDefinition::new("info").with_tag("second")),
    );
    generator.generate(&policy, false, None).await.unwrap();

    let first = generator
        .components()
        .get_block_by_tag(&policy.id, "first")
        .unwrap();
    assert!(!first
        .source_links()
        .iter()
        .any(|l| l.output == PolicyOutputEvent::Run));
}

#[tokio::test]
async fn test_run_chain_propagates_through_siblings_and_custom_wiring() {
    let log = Arc::new(EventLog::default());
    let (generator, _) = new_engine(Arc::new(NullUpdateSink));
    register_probe(&generator, &log);

    // start -> p1 (default) -> p2 (default), plus a custom start -> p2 link
    let policy = published(
        BlockDefinition::new("container")
            .with_tag("root")
            .with_permissions(vec!["ANY_ROLE"])
            .with_child(
                BlockDefinition::new("request")
                    .with_tag("start")
                    .with_permissions(vec!["ANY_ROLE"])
                    .with_options(json!({ "schema": "schema-1" }))
                    .with_event(EventConfig::new(
                        "start",
                        "p2",
                        PolicyOutputEvent::Run,
                        PolicyInputEvent::Run,
                    )),
            )
            .with_child(
                BlockDefinition::new("probe")
                    .with_tag("p1")
                    .with_permissions(vec!["ANY_ROLE"])
                    .with_options(json!({ "name": "p1" })),
            )
            .with_child(
                BlockDefinition::new("probe")
                    .with_tag("p2")
                    .with_permissions(vec!["ANY_ROLE"])
                    .with_options(json!({ "name": "p2" })),
            ),
    );
    generator.generate(&policy, false, None).await.unwrap();

    let start = generator
        .components()
        .get_block_by_tag(&policy.id, "start")
        .unwrap();
    generator
        .set_block_data(&policy.id, &owner(), &start.uuid, json!({ "field": 1 }))
        .await
        .unwrap();

    // Default chain runs depth-first before the custom link fires
    assert_eq!(log.entries(), vec!["p1", "p2", "p2"]);
}

#[tokio::test]
async fn test_unknown_wiring_target_is_soft_in_default_mode() {
    let (generator, _) = new_engine(Arc::new(NullUpdateSink));
    let policy = published(
        BlockDefinition::new("container")
            .with_tag("root")
            .with_event(EventConfig::new(
                "root",
                "no-such-tag",
                PolicyOutputEvent::Run,
                PolicyInputEvent::Run,
            )),
    );
    // Generation succeeds; the dangling rule is only a warning
    assert!(generator.generate(&policy, false, None).await.is_some());
}

// ── Permissions and Availability ─────────────────────────────────────

#[tokio::test]
async fn test_forbidden_reads_answer_none() {
    let (generator, _) = new_engine(Arc::new(NullUpdateSink));
    let policy = published(
        BlockDefinition::new("container")
            .with_tag("root")
            .with_permissions(vec!["ANY_ROLE"])
            .with_child(
                BlockDefinition::new("info")
                    .with_tag("owner-only")
                    .with_permissions(vec!["OWNER"]),
            ),
    );
    generator.generate(&policy, false, None).await.unwrap();

    let stranger = PolicyUser::new("did:example:stranger");
    assert!(generator
        .get_root_block_data(&policy.id, &stranger)
        .await
        .unwrap()
        .is_some());
    assert!(generator
        .get_block_data_by_tag(&policy.id, &stranger, "owner-only")
        .await
        .unwrap()
        .is_none());
    assert!(generator
        .get_block_data_by_tag(&policy.id, &owner(), "owner-only")
        .await
        .unwrap()
        .is_some());
    // Forbidden writes answer None too, before the behavior ever runs
    assert!(generator
        .set_block_data_by_tag(&policy.id, &stranger, "owner-only", json!({}))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_forbidden_ancestor_blocks_every_descendant() {
    let (generator, _) = new_engine(Arc::new(NullUpdateSink));
    // The gate must hold transitively: a wide-open leaf two levels under
    // an owner-only ancestor stays unreachable for everyone else
    let policy = published(
        BlockDefinition::new("container")
            .with_tag("root")
            .with_permissions(vec!["OWNER"])
            .with_child(
                BlockDefinition::new("container")
                    .with_tag("mid")
                    .with_permissions(vec!["ANY_ROLE"])
                    .with_child(
                        BlockDefinition::new("info")
                            .with_tag("leaf")
                            .with_permissions(vec!["ANY_ROLE"]),
                    ),
            ),
    );
    generator.generate(&policy, false, None).await.unwrap();

    let stranger = PolicyUser::new("did:example:stranger");
    for tag in ["mid", "leaf"] {
        assert!(
            generator
                .get_block_data_by_tag(&policy.id, &stranger, tag)
                .await
                .unwrap()
                .is_none(),
            "'{tag}' must be hidden while its ancestor is forbidden"
        );
    }
    assert!(generator
        .set_block_data_by_tag(&policy.id, &stranger, "leaf", json!({}))
        .await
        .unwrap()
        .is_none());
    // The owner clears the whole chain
    assert!(generator
        .get_block_data_by_tag(&policy.id, &owner(), "leaf")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_container_data_filters_children_by_availability() {
    let (generator, _) = new_engine(Arc::new(NullUpdateSink));
    let policy = published(
        BlockDefinition::new("container")
            .with_tag("root")
            .with_permissions(vec!["ANY_ROLE"])
            .with_child(
                BlockDefinition::new("info")
                    .with_tag("public")
                    .with_permissions(vec!["ANY_ROLE"]),
            )
            .with_child(
                BlockDefinition::new("info")
                    .with_tag("restricted")
                    .with_permissions(vec!["VERIFIER"]),
            ),
    );
    generator.generate(&policy, false, None).await.unwrap();

    let stranger = PolicyUser::new("did:example:stranger");
    let data = generator
        .get_root_block_data(&policy.id, &stranger)
        .await
        .unwrap()
        .unwrap();
    let blocks = data["blocks"].as_array().unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0]["tag"], "public");

    let verifier = PolicyUser::new("did:example:v").with_role("VERIFIER");
    let data = generator
        .get_root_block_data(&policy.id, &verifier)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data["blocks"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_step_exposes_one_child_at_a_time() {
    let (generator, _) = new_engine(Arc::new(NullUpdateSink));
    let policy = published(
        BlockDefinition::new("container")
            .with_tag("root")
            .with_permissions(vec!["ANY_ROLE"])
            .with_child(
                BlockDefinition::new("step")
                    .with_tag("wizard")
                    .with_permissions(vec!["ANY_ROLE"])
                    .with_child(
                        BlockDefinition::new("info")
                            .with_tag("one")
                            .with_permissions(vec!["ANY_ROLE"]),
                    )
                    .with_child(
                        BlockDefinition::new("info")
                            .with_tag("two")
                            .with_permissions(vec!["ANY_ROLE"]),
                    ),
            ),
    );
    generator.generate(&policy, false, None).await.unwrap();
    let components = generator.components();
    let user = owner();

    // Fresh step: first child active, second hidden
    assert!(generator
        .get_block_data_by_tag(&policy.id, &user, "one")
        .await
        .unwrap()
        .is_some());
    assert!(generator
        .get_block_data_by_tag(&policy.id, &user, "two")
        .await
        .unwrap()
        .is_none());

    // Running the active child advances the cursor
    let one = components.get_block_by_tag(&policy.id, "one").unwrap();
    let event = BlockEvent {
        policy_id: policy.id.clone(),
        source: one.uuid.clone(),
        input: PolicyInputEvent::Run,
        user: user.clone(),
        data: json!({}),
    };
    components.dispatch_event(&one.uuid, event).await;

    assert!(generator
        .get_block_data_by_tag(&policy.id, &user, "one")
        .await
        .unwrap()
        .is_none());
    assert!(generator
        .get_block_data_by_tag(&policy.id, &user, "two")
        .await
        .unwrap()
        .is_some());
}

// ── Updates ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_updates_coalesce_into_one_reduced_broadcast() {
    let sink = Arc::new(RecordingSink::default());
    let (generator, _) = new_engine(sink.clone());
    let policy = published(
        BlockDefinition::new("container")
            .with_tag("root")
            .with_permissions(vec!["OWNER"])
            .with_child(
                BlockDefinition::new("request")
                    .with_tag("apply")
                    .with_permissions(vec!["OWNER"])
                    .with_options(json!({ "schema": "schema-1" })),
            ),
    );
    generator.generate(&policy, false, None).await.unwrap();
    let apply = generator
        .components()
        .get_block_by_tag(&policy.id, "apply")
        .unwrap();

    for n in 0..3 {
        generator
            .set_block_data(&policy.id, &owner(), &apply.uuid, json!({ "n": n }))
            .await
            .unwrap();
    }
    assert!(sink.updates().is_empty());

    tokio::time::sleep(Duration::from_millis(120)).await;
    let updates = sink.updates();
    assert_eq!(updates.len(), 1, "three writes must coalesce into one");
    assert_eq!(updates[0].0, owner().id());
    assert_eq!(updates[0].1, vec![apply.uuid.clone()]);
}

#[tokio::test]
async fn test_reduction_keeps_only_topmost_dirty_blocks() {
    let (generator, _) = new_engine(Arc::new(NullUpdateSink));
    let policy = published(
        BlockDefinition::new("container")
            .with_tag("root")
            .with_child(
                BlockDefinition::new("container")
                    .with_tag("mid")
                    .with_child(BlockDefinition::new("info").with_tag("leaf")),
            )
            .with_child(BlockDefinition::new("info").with_tag("side")),
    );
    generator.generate(&policy, false, None).await.unwrap();
    let components = generator.components();
    let id_of = |tag: &str| components.get_block_by_tag(&policy.id, tag).unwrap().uuid.clone();

    let dirty = [id_of("mid"), id_of("leaf"), id_of("side")]
        .into_iter()
        .collect();
    let reduced = components.reduce_update_set(&policy.id, &dirty);

    assert_eq!(reduced.len(), 2);
    assert!(reduced.contains(&id_of("mid")));
    assert!(reduced.contains(&id_of("side")));
    assert!(!reduced.contains(&id_of("leaf")));
}

#[tokio::test]
async fn test_dry_run_updates_go_to_virtual_user() {
    let sink = Arc::new(RecordingSink::default());
    let (generator, store) = new_engine(sink.clone());
    let policy = published(
        BlockDefinition::new("container")
            .with_tag("root")
            .with_permissions(vec!["ANY_ROLE"])
            .with_child(
                BlockDefinition::new("request")
                    .with_tag("apply")
                    .with_permissions(vec!["ANY_ROLE"])
                    .with_options(json!({ "schema": "schema-1" })),
            ),
    )
    .with_status(PolicyStatus::DryRun);
    store.set_virtual_user(&policy.id, PolicyUser::virtual_user("did:virtual:1"));
    generator.generate(&policy, false, None).await.unwrap();

    let apply = generator
        .components()
        .get_block_by_tag(&policy.id, "apply")
        .unwrap();
    generator
        .set_block_data(&policy.id, &owner(), &apply.uuid, json!({ "n": 1 }))
        .await
        .unwrap();
    generator.flush_updates(&policy.id, &PolicyUser::virtual_user("did:virtual:1")).await;

    let updates = sink.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, "did:virtual:1");
}

#[tokio::test]
async fn test_flush_does_not_shorten_the_next_window() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let sink = Arc::new(RecordingSink::default());
    let store = Arc::new(InMemoryPolicyStore::new());
    let generator = BlockTreeGenerator::new(
        EngineConfig::new().with_debounce_window(Duration::from_millis(100)),
        store,
        sink.clone(),
    );
    let policy = published(
        BlockDefinition::new("container")
            .with_tag("root")
            .with_permissions(vec!["OWNER"])
            .with_child(
                BlockDefinition::new("request")
                    .with_tag("apply")
                    .with_permissions(vec!["OWNER"])
                    .with_options(json!({ "schema": "schema-1" })),
            ),
    );
    generator.generate(&policy, false, None).await.unwrap();
    let apply = generator
        .components()
        .get_block_by_tag(&policy.id, "apply")
        .unwrap();

    // Arm a timer, then empty its pending set right away
    generator
        .set_block_data(&policy.id, &owner(), &apply.uuid, json!({ "n": 1 }))
        .await
        .unwrap();
    generator.flush_updates(&policy.id, &owner()).await;
    assert_eq!(sink.updates().len(), 1);

    // A new set armed at ~t=60 gets its own timer at ~t=160
    tokio::time::sleep(Duration::from_millis(60)).await;
    generator
        .set_block_data(&policy.id, &owner(), &apply.uuid, json!({ "n": 2 }))
        .await
        .unwrap();

    // The first timer expires around t=100; it must not fire the new set
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(sink.updates().len(), 1, "the second window must run in full");

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(sink.updates().len(), 2);
}

// ── Single Flight ────────────────────────────────────────────────────

#[tokio::test]
async fn test_exclusive_blocks_reject_overlapping_writes() {
    let (generator, _) = new_engine(Arc::new(NullUpdateSink));
    generator.components().kinds().register(
        "slow",
        Arc::new(|_| Ok(Box::new(SlowBehavior) as Box<dyn BlockBehavior>)),
    );
    let policy = published(
        BlockDefinition::new("container")
            .with_tag("root")
            .with_permissions(vec!["ANY_ROLE"])
            .with_child(
                BlockDefinition::new("slow")
                    .with_tag("gate")
                    .with_permissions(vec!["ANY_ROLE"]),
            ),
    );
    generator.generate(&policy, false, None).await.unwrap();
    let gate = generator
        .components()
        .get_block_by_tag(&policy.id, "gate")
        .unwrap();
    let user = owner();

    let (first, second) = tokio::join!(
        generator.set_block_data(&policy.id, &user, &gate.uuid, json!({})),
        generator.set_block_data(&policy.id, &user, &gate.uuid, json!({})),
    );
    let busy_count = [&first, &second]
        .iter()
        .filter(|r| matches!(r, Err(PolicyError::Busy { .. })))
        .count();
    assert_eq!(busy_count, 1);
    assert_eq!([&first, &second].iter().filter(|r| r.is_ok()).count(), 1);

    // The slot is released once the first write finishes
    assert!(generator
        .set_block_data(&policy.id, &user, &gate.uuid, json!({}))
        .await
        .is_ok());

    // Another user is never blocked by the first user's flight
    let other = PolicyUser::new("did:example:other");
    let (slow, ok) = tokio::join!(
        generator.set_block_data(&policy.id, &user, &gate.uuid, json!({})),
        generator.set_block_data(&policy.id, &other, &gate.uuid, json!({})),
    );
    assert!(slow.is_ok());
    assert!(ok.is_ok());
}

// ── Groups ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_group_selection_round_trip() {
    let (generator, store) = new_engine(Arc::new(NullUpdateSink));
    let policy = published(
        BlockDefinition::new("container")
            .with_tag("root")
            .with_permissions(vec!["ANY_ROLE"]),
    )
    .with_group(policy_types::GroupTemplate {
        name: "Verifiers".into(),
        role: "VERIFIER".into(),
        label: None,
    });
    let user = PolicyUser::new("did:example:alice");
    store.add_member(&policy.id, MemberRecord::new(&user.did));
    store.add_group(
        &policy.id,
        &user.did,
        GroupRecord {
            uuid: "g-1".into(),
            name: "Verifiers".into(),
            role: "VERIFIER".into(),
            owner: "did:example:alice".into(),
            active: false,
        },
    );
    generator.generate(&policy, false, None).await.unwrap();

    let groups = generator.get_policy_groups(&policy.id, &user).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["active"], false);

    generator
        .select_policy_group(&policy.id, &user, Some("g-1"))
        .await
        .unwrap();
    let groups = generator.get_policy_groups(&policy.id, &user).await.unwrap();
    assert_eq!(groups[0]["active"], true);

    // A group the user does not belong to is rejected
    assert!(generator
        .select_policy_group(&policy.id, &user, Some("g-other"))
        .await
        .is_err());
}

// ── Validation ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_validate_rejects_non_object_definitions() {
    let (generator, _) = new_engine(Arc::new(NullUpdateSink));
    let report = generator.validate(&json!("not a policy")).await;
    assert!(report.is_bad_policy);
}

#[tokio::test]
async fn test_validate_flags_block_problems() {
    let (generator, _) = new_engine(Arc::new(NullUpdateSink));
    let policy = published(
        BlockDefinition::new("container")
            .with_tag("root")
            // request without a schema option
            .with_child(BlockDefinition::new("request").with_tag("apply")),
    );
    let report = generator.validate_policy(&policy).await;
    assert!(!report.is_valid());
    assert!(report.blocks.iter().any(|b| {
        b.tag.as_deref() == Some("apply") && b.errors.iter().any(|e| e.contains("schema"))
    }));
}

#[tokio::test]
async fn test_validate_checks_roles_against_group_templates() {
    let (generator, _) = new_engine(Arc::new(NullUpdateSink));
    let policy = published(
        BlockDefinition::new("container")
            .with_tag("root")
            .with_permissions(vec!["AUDITOR"]),
    )
    .with_group(policy_types::GroupTemplate {
        name: "Verifiers".into(),
        role: "VERIFIER".into(),
        label: None,
    });
    let report = generator.validate_policy(&policy).await;
    assert!(report
        .blocks
        .iter()
        .any(|b| b.errors.iter().any(|e| e.contains("AUDITOR"))));
}

// ── Teardown ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_destroy_leaves_nothing_behind() {
    let sink = Arc::new(RecordingSink::default());
    let (generator, _) = new_engine(sink.clone());
    let policy = published(
        BlockDefinition::new("container")
            .with_tag("root")
            .with_permissions(vec!["OWNER"])
            .with_child(
                BlockDefinition::new("request")
                    .with_tag("apply")
                    .with_permissions(vec!["OWNER"])
                    .with_options(json!({ "schema": "schema-1" })),
            ),
    );
    generator.generate(&policy, false, None).await.unwrap();
    let apply = generator
        .components()
        .get_block_by_tag(&policy.id, "apply")
        .unwrap();

    // Leave a pending broadcast behind, then destroy before it fires
    generator
        .set_block_data(&policy.id, &owner(), &apply.uuid, json!({ "n": 1 }))
        .await
        .unwrap();
    generator.destroy(&policy.id).await;

    let components = generator.components();
    assert!(components.policy(&policy.id).is_none());
    assert!(components.get_block(&apply.uuid).is_none());
    assert!(components.get_block_by_tag(&policy.id, "root").is_none());
    assert!(components.policy_block_ids(&policy.id).is_empty());
    assert_eq!(components.scheduler().pending_users(), 0);
    assert_eq!(components.policy_lock_count(), 0, "destroy must drop the build lock");

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(sink.updates().is_empty(), "cancelled timers must not fire");
}

#[tokio::test]
async fn test_regenerate_restores_persisted_step_positions() {
    let (generator, _) = new_engine(Arc::new(NullUpdateSink));
    // Persisted state is keyed by uuid, so the step declares a fixed one
    let mut wizard = BlockDefinition::new("step")
        .with_tag("wizard")
        .with_permissions(vec!["ANY_ROLE"]);
    wizard.id = Some(BlockId::new("wizard-id"));
    let policy = published(
        wizard
            .with_child(
                BlockDefinition::new("info")
                    .with_tag("one")
                    .with_permissions(vec!["ANY_ROLE"]),
            )
            .with_child(
                BlockDefinition::new("info")
                    .with_tag("two")
                    .with_permissions(vec!["ANY_ROLE"]),
            ),
    );
    let user = owner();
    generator.generate(&policy, false, None).await.unwrap();

    let components = generator.components();
    let one = components.get_block_by_tag(&policy.id, "one").unwrap();
    let event = BlockEvent {
        policy_id: policy.id.clone(),
        source: one.uuid.clone(),
        input: PolicyInputEvent::Run,
        user: user.clone(),
        data: json!({}),
    };
    components.dispatch_event(&one.uuid, event).await;
    assert!(generator
        .get_block_data_by_tag(&policy.id, &user, "two")
        .await
        .unwrap()
        .is_some());

    // Destroy keeps persisted state; a fresh generate picks it back up
    generator.destroy(&policy.id).await;
    generator.generate(&policy, false, None).await.unwrap();
    assert!(generator
        .get_block_data_by_tag(&policy.id, &user, "two")
        .await
        .unwrap()
        .is_some());
    assert!(generator
        .get_block_data_by_tag(&policy.id, &user, "one")
        .await
        .unwrap()
        .is_none());
}

// ── Request Surface ──────────────────────────────────────────────────

#[tokio::test]
async fn test_block_parents_and_tag_lookup() {
    let (generator, _) = new_engine(Arc::new(NullUpdateSink));
    let policy = published(
        BlockDefinition::new("container")
            .with_tag("root")
            .with_child(
                BlockDefinition::new("container")
                    .with_tag("mid")
                    .with_child(BlockDefinition::new("info").with_tag("leaf")),
            ),
    );
    generator.generate(&policy, false, None).await.unwrap();
    let components = generator.components();
    let id_of = |tag: &str| components.get_block_by_tag(&policy.id, tag).unwrap().uuid.clone();

    let chain = generator.get_block_parents(&policy.id, &id_of("leaf")).unwrap();
    assert_eq!(chain, vec![id_of("leaf"), id_of("mid"), id_of("root")]);

    let resolved = generator.block_by_tag(&policy.id, "leaf").unwrap();
    assert_eq!(resolved["id"], serde_json::to_value(id_of("leaf")).unwrap());
    assert!(generator.block_by_tag(&policy.id, "nope").is_err());
}

#[tokio::test]
async fn test_serialize_policy_reconstructs_the_tree() {
    let (generator, _) = new_engine(Arc::new(NullUpdateSink));
    let policy = published(
        BlockDefinition::new("container")
            .with_tag("root")
            .with_child(BlockDefinition::new("info").with_tag("welcome")),
    );
    let root = generator.generate(&policy, false, None).await.unwrap();

    let serialized = generator.serialize_policy(&policy.id).unwrap();
    assert_eq!(serialized.block_type, "container");
    assert_eq!(serialized.id, Some(root.uuid.clone()));
    assert_eq!(serialized.children.len(), 1);
    assert_eq!(serialized.children[0].tag.as_deref(), Some("welcome"));
    assert!(serialized.children[0].id.is_some());
}
