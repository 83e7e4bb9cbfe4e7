//! Multi-session soak harness.
//!
//! Spins up N editor sessions on one broadcast hub and one shared backend,
//! drives scripted random edits through them, waits for quiescence, and
//! verifies that every store and the durable state converged. Each session
//! edits its own slice of the id space; with disjoint writers the engine
//! must converge exactly, so any divergence is a bug, not a data race in
//! the script.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Instant, sleep, timeout};
use tracing::info;

use tabula_store::{
    MigrationSequence, Record, RecordId, RecordScope, Store, StoreSchema,
};
use tabula_sync::{
    CancelToken, DocumentChannel, DocumentId, FsBackend, LocalHub, MemoryBackend, SessionEvent,
    StorageBackend, SyncClient, SyncConfig,
};

#[derive(clap::Args, Debug)]
pub struct SoakArgs {
    /// Concurrent editor sessions
    #[arg(long, default_value_t = 4)]
    sessions: usize,

    /// Random edits to drive through the sessions
    #[arg(long, default_value_t = 200)]
    edits: usize,

    /// Seed for the edit script
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Use a filesystem backend rooted here instead of memory
    #[arg(long)]
    dir: Option<PathBuf>,
}

struct SoakSession {
    store: Arc<Store>,
    // dropped at the end of the run, which disposes the client
    _client: SyncClient,
    events: UnboundedReceiver<SessionEvent>,
}

fn soak_schema() -> Arc<StoreSchema> {
    let mut schema = StoreSchema::new();
    schema.register_type("shape", RecordScope::Document);
    schema.register_type("camera", RecordScope::Session);
    schema.add_sequence(MigrationSequence::new("doc", vec![]));
    Arc::new(schema)
}

async fn wait_for_loaded(events: &mut UnboundedReceiver<SessionEvent>) -> Result<()> {
    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .map_err(|_| anyhow::anyhow!("session did not finish startup"))?
        .ok_or_else(|| anyhow::anyhow!("session event channel closed"))?;
    match event {
        SessionEvent::Loaded => Ok(()),
        other => bail!("session failed to start: {other:?}"),
    }
}

pub async fn run(args: SoakArgs) -> Result<()> {
    if args.sessions == 0 {
        bail!("need at least one session");
    }

    let backend: Arc<dyn StorageBackend> = match &args.dir {
        Some(dir) => Arc::new(FsBackend::new(dir)),
        None => Arc::new(MemoryBackend::new()),
    };
    let hub = LocalHub::new();
    let document_id = DocumentId::new("soak");
    let config = SyncConfig {
        debounce: Duration::from_millis(25),
        ..Default::default()
    };

    let mut sessions = Vec::with_capacity(args.sessions);
    for _ in 0..args.sessions {
        let store = Arc::new(Store::new(soak_schema()));
        let channel: Arc<dyn DocumentChannel> = Arc::new(hub.open(&document_id));
        let (client, events) = SyncClient::new(
            document_id.clone(),
            Arc::clone(&store),
            Arc::clone(&backend),
            channel,
            config.clone(),
        );
        sessions.push(SoakSession {
            store,
            _client: client,
            events,
        });
    }
    for session in &mut sessions {
        wait_for_loaded(&mut session.events).await?;
    }
    info!(sessions = args.sessions, "all sessions loaded");

    let mut rng = StdRng::seed_from_u64(args.seed);
    for i in 0..args.edits {
        let owner = rng.random_range(0..sessions.len());
        let session = &sessions[owner];
        // each session edits only its own ids; see the module docs
        let id = format!("shape-{owner}-{}", rng.random_range(0..25));
        let roll: f64 = rng.random();
        if roll < 0.7 {
            session.store.put([Record::new(
                id.as_str(),
                "shape",
                json!({ "x": rng.random_range(0..1000) }),
            )]);
        } else if roll < 0.9 {
            session.store.remove(&[RecordId::new(id.as_str())]);
        } else {
            // session-scope traffic exercises the snapshot path without
            // touching shared state
            session.store.put([Record::new(
                format!("camera-{owner}"),
                "camera",
                json!({ "zoom": rng.random_range(1..10) }),
            )]);
        }
        if i % 16 == 0 {
            sleep(Duration::from_millis(1)).await;
        }
    }
    info!(edits = args.edits, "edit script complete, waiting for quiescence");

    let cancel = CancelToken::new();
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        sleep(Duration::from_millis(50)).await;

        let reference = sessions[0].store.records_in_scope(RecordScope::Document);
        let converged = sessions
            .iter()
            .all(|s| s.store.records_in_scope(RecordScope::Document) == reference);
        let durable = backend
            .load(&document_id, &cancel)
            .await?
            .map(|snapshot| snapshot.records)
            .unwrap_or_default();

        if converged && durable == reference {
            if durable.values().any(|r| r.type_name != "shape") {
                bail!("session-scope records leaked into the shared record table");
            }
            info!(
                sessions = args.sessions,
                edits = args.edits,
                records = reference.len(),
                "soak converged"
            );
            return Ok(());
        }
        if Instant::now() > deadline {
            bail!(
                "soak did not converge: {} store(s), durable holds {} record(s), reference {}",
                if converged { "equal" } else { "divergent" },
                durable.len(),
                reference.len()
            );
        }
    }
}
