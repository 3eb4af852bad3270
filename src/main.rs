mod remote;

use std::env;

use offline_sync::{
    Backend, ConflictAction, ConflictPolicy, EngineConfig, MergeStrategy, OfflineEngine, Payload, ProcessReport,
    QueueKind, UploadPart, VectorClock,
};
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use remote::SimulatedRemote;

const BOARD: &str = "launch-plan";
const VIEW: &str = "kanban";
const DOC: &str = "launch-brief";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    let flag = |name: &str| args.iter().position(|a| a == name).and_then(|i| args.get(i + 1));

    let config = match flag("--config") {
        Some(path) => match EngineConfig::from_json_file(path) {
            Ok(config) => config,
            Err(err) => {
                error!(%path, %err, "could not read config");
                std::process::exit(2);
            }
        },
        None => EngineConfig::default().with_node_id("laptop").with_max_attempts(4),
    };
    let drop_rate: f64 = flag("--drop-rate").and_then(|s| s.parse().ok()).unwrap_or(0.3);
    let seed: u64 = flag("--seed").and_then(|s| s.parse().ok()).unwrap_or(42);
    let rounds: usize = flag("--rounds").and_then(|s| s.parse().ok()).unwrap_or(12);

    if let Err(err) = run(config, SimulatedRemote::new(seed, drop_rate), rounds) {
        error!(%err, "offline session failed");
        std::process::exit(1);
    }
}

fn run(config: EngineConfig, mut remote: SimulatedRemote, rounds: usize) -> offline_sync::Result<()> {
    let engine = OfflineEngine::open(config)?;
    if let Some(reason) = engine.fallback_reason() {
        warn!(%reason, "persistent store unavailable, queue will not survive a restart");
    }
    info!(node = %engine.node_id(), backend = ?engine.backend(), "engine ready");

    // A teammate touched item-2 while we were offline.
    remote.seed_record(
        "item-2",
        json!({ "id": "item-2", "title": "Press kit", "points": 3, "tags": ["design"] }),
        VectorClock::from([("teammate", 3)]),
    );

    go_offline(&engine)?;
    info!(pending = engine.pending_count()?, "offline edits queued");

    for round in 1..=rounds {
        let reports = [
            ("item", engine.process_item_mutation_queue(BOARD, &mut remote)?),
            ("board", engine.process_board_mutation_queue(BOARD, VIEW, &mut remote)?),
            ("doc", engine.process_doc_operation_queue(DOC, &mut remote)?),
            ("comment", engine.process_comment_mutation_queue("item-1", &mut remote)?),
            ("file", engine.process_file_upload_queue("item-1", &mut remote)?),
        ];
        for (queue, report) in &reports {
            settle(&engine, &mut remote, queue, report)?;
        }

        let pending = engine.pending_count()?;
        info!(round, pending, "drain finished");
        if pending == 0 {
            break;
        }
    }

    let purged = engine.purge_synced(QueueKind::Doc)?;
    let (requests, dropped) = remote.stats();
    info!(
        requests,
        dropped,
        purged,
        doc_ops = remote.doc_len(DOC),
        item_2 = %remote.record("item-2").cloned().unwrap_or_default(),
        "session complete"
    );
    if engine.backend() == Backend::Persistent && engine.pending_count()? > 0 {
        info!("unsent operations stay queued for the next run");
    }
    Ok(())
}

fn go_offline(engine: &OfflineEngine) -> offline_sync::Result<()> {
    engine.save_board_snapshot(
        BOARD,
        VIEW,
        vec![
            json!({ "id": "item-2", "title": "Press kit", "status": "todo", "points": 0 }),
        ],
    )?;

    let create = engine
        .enqueue_item_mutation(BOARD, "item-1", Payload::Create { record: json!({ "title": "Landing page", "points": 5 }) })
        .commit()?;
    engine
        .enqueue_board_mutation(BOARD, VIEW, "item-1", Payload::Move { from: json!("todo"), to: json!("doing") })
        .depends_on(&create.id)
        .commit()?;

    engine
        .enqueue_item_mutation(BOARD, "item-2", Payload::Update { field: "points".into(), value: json!(2) })
        .policy(ConflictPolicy::new(MergeStrategy::NumericSum).on_field("points"))
        .commit()?;
    engine
        .enqueue_item_mutation(BOARD, "item-2", Payload::Update { field: "tags".into(), value: json!(["launch", "design"]) })
        .policy(ConflictPolicy::new(MergeStrategy::SetUnion).on_field("tags"))
        .commit()?;
    engine
        .enqueue_item_mutation(BOARD, "item-2", Payload::Update { field: "title".into(), value: json!("Press kit v2") })
        .commit()?;

    for ops in [vec![json!({ "insert": "Launch brief\n" })], vec![json!({ "retain": 13 }), json!({ "insert": "Owner: ops\n" })]] {
        engine.enqueue_doc_operation(DOC, ops).batch("brief-header").commit()?;
    }

    let comment = engine
        .enqueue_comment_mutation("item-1", "comment-1", Payload::Create { record: json!({ "body": "Copy is ready" }) })
        .depends_on(&create.id)
        .commit()?;
    engine
        .enqueue_file_upload(
            "item-1",
            "file-1",
            Payload::UploadParts {
                file_name: "hero.png".into(),
                parts: (0..3).map(|index| UploadPart { index, size: 512 * 1024, checksum: None, uploaded: false }).collect(),
            },
        )
        .depends_on(&comment.id)
        .commit()?;

    for (key, ops) in engine.pending_batches(QueueKind::Doc, DOC)? {
        info!(batch = %key, members = ops.len(), "doc batch queued");
    }
    Ok(())
}

/// Feeds a drain report back into the session: merged records go to the
/// remote, manual conflicts take the remote side, failed sends are re-armed.
fn settle(
    engine: &OfflineEngine,
    remote: &mut SimulatedRemote,
    queue: &str,
    report: &ProcessReport,
) -> offline_sync::Result<()> {
    if report != &ProcessReport::default() {
        info!(
            queue,
            processed = report.processed.len(),
            merged = report.applied_remote.len(),
            conflicts = report.conflicts.len(),
            skipped = report.skipped.len(),
            deferred = report.deferred.len(),
            held = report.held.len(),
            retrying = report.retrying.len(),
            failed = report.failed.len(),
            "queue drained"
        );
    }
    for applied in &report.applied_remote {
        info!(entity = %applied.entity_id, resolution = ?applied.resolution, "applying reconciled record");
        remote.accept(&applied.entity_id, applied.record.clone());
    }
    if !report.is_halted() {
        return Ok(());
    }

    for conflict in &report.conflicts {
        warn!(
            op_id = %conflict.operation.id,
            entity = %conflict.operation.entity_id,
            reason = conflict.reason.as_deref().unwrap_or("unspecified"),
            "manual conflict, keeping remote"
        );
        engine.resolve_conflict(&conflict.operation.id, ConflictAction::Discard, Some(conflict.remote.clone()))?;
    }
    for failed in &report.failed {
        warn!(op_id = %failed.op_id, attempt = failed.attempt, error = %failed.error, "re-arming failed operation");
        engine.resolve_conflict(&failed.op_id, ConflictAction::Retry, None)?;
    }
    Ok(())
}
