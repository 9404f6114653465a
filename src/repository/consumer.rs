//! Command consumer: worker pool and per-command pipeline.
//!
//! Workers pull publishes off a bounded intake queue and drive each
//! command through lock acquisition, execution, stamping, journal append,
//! index update and subscriber notification.
//!
//! Locking and user execution run concurrently across workers; the stamp
//! and append of a command's whole batch happen inside one critical
//! section (`append_gate`), so journal order equals HLC order by
//! construction and every batch's stamps are contiguous in the total
//! order.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Sender, bounded};

use crate::core::{
    Command, CommandTerminatedExceptionally, Entity, EntityId, EntityLayoutIntroduced,
    EntityRecord, EventCausalityEstablished, Fingerprint, HostError, HostErrorOccurred,
    HybridClock, Layout, LayoutRegistry, PropertyType, Value, assemble_frame, encode_payload,
};
use crate::index::IndexEngine;
use crate::journal::{EntityKind, Journal, JournalEntry, JournalError};

use super::PublishError;
use super::future::{CommandFuture, command_future};
use super::lock::LockProvider;
use super::subscriber::{CommittedEntity, EntitySubscriber, notify_all};

/// Everything a worker needs to run a command.
pub(crate) struct ConsumerShared {
    pub(crate) clock: Arc<HybridClock>,
    pub(crate) journal: Arc<dyn Journal>,
    pub(crate) index: Arc<dyn IndexEngine>,
    pub(crate) locks: Arc<dyn LockProvider>,
    pub(crate) layouts: Arc<LayoutRegistry>,
    /// Fingerprints already introduced in the journal.
    pub(crate) introduced: Mutex<HashSet<Fingerprint>>,
    /// Serializes stamping + append; see module docs.
    pub(crate) append_gate: Mutex<()>,
    pub(crate) lock_timeout: Duration,
    pub(crate) subscriber_budget: Duration,
}

type Job = Box<dyn FnOnce(&ConsumerShared) + Send>;

/// Worker pool over a bounded FIFO intake queue.
pub(crate) struct CommandConsumer {
    shared: Arc<ConsumerShared>,
    intake: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl CommandConsumer {
    pub(crate) fn start(
        shared: Arc<ConsumerShared>,
        worker_count: usize,
        queue_depth: usize,
    ) -> Result<Self, std::io::Error> {
        let (intake, feed) = bounded::<Job>(queue_depth.max(1));
        let mut workers = Vec::with_capacity(worker_count.max(1));
        for i in 0..worker_count.max(1) {
            let feed = feed.clone();
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("eventory-worker-{i}"))
                .spawn(move || {
                    while let Ok(job) = feed.recv() {
                        job(&shared);
                    }
                })?;
            workers.push(handle);
        }
        Ok(Self {
            shared,
            intake: Some(intake),
            workers,
        })
    }

    /// Enqueue a command. Blocks while the intake queue is full; that is
    /// the back-pressure contract.
    pub(crate) fn publish<C: Command>(
        &self,
        command: C,
        subscribers: Vec<Arc<dyn EntitySubscriber>>,
    ) -> CommandFuture<C::Output> {
        let (future, slot, claim) = command_future();
        let job: Job = Box::new(move |shared| {
            if !claim.claim() {
                slot.complete(Err(PublishError::Cancelled));
                return;
            }
            let result = run_command(shared, &command, &subscribers);
            slot.complete(result);
        });
        if let Some(intake) = &self.intake {
            // A send error means the workers are gone; dropping the job
            // resolves the future as IllegalState.
            let _ = intake.send(job);
        }
        future
    }

    /// Fingerprints currently known to be introduced in the journal.
    pub(crate) fn introduced_snapshot(&self) -> HashSet<Fingerprint> {
        self.shared
            .introduced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Stop accepting publishes, drain the queue, join the workers.
    pub(crate) fn stop(&mut self) {
        self.intake = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for CommandConsumer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A serialized-but-unstamped entity waiting for the append gate.
struct Draft {
    id: EntityId,
    layout: Arc<Layout>,
    values: Vec<Value>,
    payload: Vec<u8>,
}

fn draft(
    shared: &ConsumerShared,
    layout: Arc<Layout>,
    values: Vec<Value>,
) -> Result<Draft, PublishError> {
    shared.layouts.register(layout.clone())?;
    let payload = encode_payload(&layout, &values, &shared.layouts.snapshot())?;
    Ok(Draft {
        id: EntityId::random(),
        layout,
        values,
        payload,
    })
}

enum Executed<S> {
    Success(S, Vec<Draft>),
    HostFailure(HostError),
    EncodeFailure(Box<PublishError>),
}

fn execute_command<C: Command>(shared: &ConsumerShared, command: &C) -> Executed<C::State> {
    let mut stream = match command.execute() {
        Ok(stream) => stream,
        Err(err) => return Executed::HostFailure(err),
    };
    let mut drafts = Vec::new();
    while let Some(item) = stream.pull() {
        match item {
            Ok(event) => match draft(shared, event.layout(), event.values()) {
                Ok(d) => drafts.push(d),
                Err(err) => return Executed::EncodeFailure(Box::new(err)),
            },
            Err(err) => return Executed::HostFailure(err),
        }
    }
    Executed::Success(stream.into_state(), drafts)
}

/// Drive one command through the whole pipeline.
pub(crate) fn run_command<C: Command>(
    shared: &ConsumerShared,
    command: &C,
    subscribers: &[Arc<dyn EntitySubscriber>],
) -> Result<C::Output, PublishError> {
    // A command that cannot encode is refused before any lock or journal
    // work; nothing is persisted.
    let cmd_draft = draft(shared, command.layout(), command.values())?;

    // Locking: ascending name order, deduped, each bounded by the
    // configured timeout.
    let mut names = command.locks();
    names.sort();
    names.dedup();
    let mut guards = Vec::with_capacity(names.len());
    for name in &names {
        match shared.locks.try_acquire(name, shared.lock_timeout)? {
            Some(guard) => guards.push(guard),
            None => {
                return Err(PublishError::LockTimeout {
                    name: name.clone(),
                    timeout_ms: shared.lock_timeout.as_millis() as u64,
                });
            }
        }
    }

    // Executing: drive the stream to completion, buffering serialized
    // drafts. On host failure the buffered user events are abandoned and
    // the failure pair takes their place.
    let (event_drafts, resolution) = match execute_command(shared, command) {
        Executed::Success(state, drafts) => (drafts, Ok(state)),
        Executed::HostFailure(err) => {
            tracing::warn!(error = %err, "command execution failed; recording failure events");
            let terminated = CommandTerminatedExceptionally::new(err.to_string());
            let occurred = HostErrorOccurred::from(&err);
            let drafts = vec![
                draft(shared, terminated.layout(), terminated.values())?,
                draft(shared, occurred.layout(), occurred.values())?,
            ];
            (drafts, Err(PublishError::Host(err)))
        }
        Executed::EncodeFailure(err) => {
            tracing::warn!(error = %err, "event serialization failed; recording termination");
            let terminated = CommandTerminatedExceptionally::new(err.to_string());
            let drafts = vec![draft(shared, terminated.layout(), terminated.values())?];
            (drafts, Err(*err))
        }
    };

    // Appending: stamp and append the whole batch inside the gate.
    let committed = append_batch(shared, cmd_draft, event_drafts)?;

    // Indexing, while the command's locks are still held. The batch is
    // already durable; an index failure degrades queries, not history.
    for entity in &committed {
        if let Err(err) = shared.index.add_to_collection(&entity.record) {
            tracing::error!(error = %err, id = %entity.record.id(), "index update failed");
        }
    }

    // Notifying, still inside the locks.
    notify_all(subscribers, &committed, shared.subscriber_budget);

    drop(guards);
    resolution.map(|state| command.result(state))
}

/// Stamp command + events and append them in one journal transaction.
///
/// Journal order within the batch: layout introductions, the command,
/// then per user event its causality edge followed by the event itself.
/// Stamps are ticked in exactly that order, so journal order and stamp
/// order agree entity by entity.
fn append_batch(
    shared: &ConsumerShared,
    cmd_draft: Draft,
    event_drafts: Vec<Draft>,
) -> Result<Vec<CommittedEntity>, PublishError> {
    let gate = shared.append_gate.lock().unwrap_or_else(|e| e.into_inner());
    let mut introduced = shared.introduced.lock().unwrap_or_else(|e| e.into_inner());
    let intro_fp = EntityLayoutIntroduced::layout().fingerprint();

    // Layouts needing introduction, referenced layouts first.
    let mut seen = HashSet::new();
    let mut need: Vec<Arc<Layout>> = Vec::new();
    push_with_refs(&cmd_draft.layout, shared, intro_fp, &introduced, &mut seen, &mut need);
    if !event_drafts.is_empty() {
        push_with_refs(
            &EventCausalityEstablished::layout(),
            shared,
            intro_fp,
            &introduced,
            &mut seen,
            &mut need,
        );
    }
    for d in &event_drafts {
        push_with_refs(&d.layout, shared, intro_fp, &introduced, &mut seen, &mut need);
    }

    let mut intro_drafts = Vec::with_capacity(need.len());
    for layout in &need {
        let intro = EntityLayoutIntroduced::new(layout);
        intro_drafts.push(draft(shared, intro.layout(), intro.values())?);
    }

    let cmd_id = cmd_draft.id;
    let mut entries: Vec<JournalEntry> = Vec::new();
    let mut committed: Vec<CommittedEntity> = Vec::new();
    let mut push = |shared: &ConsumerShared, d: Draft, kind: EntityKind, cause: Option<EntityId>| {
        let at = shared.clock.tick();
        let bytes = assemble_frame(d.layout.fingerprint(), &at, d.id, &d.payload);
        let record = EntityRecord::new(d.id, at.clone(), d.layout, d.values);
        entries.push(JournalEntry {
            kind,
            fingerprint: record.fingerprint(),
            id: d.id,
            at,
            cause,
            bytes,
        });
        committed.push(CommittedEntity { kind, record, cause });
    };

    for intro in intro_drafts {
        push(shared, intro, EntityKind::Event, Some(cmd_id));
    }
    push(shared, cmd_draft, EntityKind::Command, None);
    for d in event_drafts {
        let edge = EventCausalityEstablished::new(d.id, cmd_id);
        let edge_draft = draft(shared, edge.layout(), edge.values())?;
        push(shared, edge_draft, EntityKind::Event, Some(cmd_id));
        push(shared, d, EntityKind::Event, Some(cmd_id));
    }

    let mut tx = shared.journal.begin()?;
    let appended = (|| -> Result<(), JournalError> {
        for entry in entries {
            match entry.kind {
                EntityKind::Command => tx.append_command(entry)?,
                EntityKind::Event => tx.append_event(entry)?,
            }
        }
        Ok(())
    })();
    match appended {
        Ok(()) => tx.commit()?,
        Err(err) => {
            tx.abort();
            return Err(err.into());
        }
    }

    // Only after a durable commit do the introductions count.
    for layout in &need {
        introduced.insert(layout.fingerprint());
    }
    // Explicit introduction events (the IntroduceEntityLayouts command's
    // own stream) introduce their targets too.
    for entity in &committed {
        if entity.record.fingerprint() == intro_fp
            && let Some(Value::Bytes(raw)) = entity.record.property("fingerprint")
            && let Ok(fp) = <[u8; 20]>::try_from(raw.as_slice())
        {
            introduced.insert(Fingerprint::from_bytes(fp));
        }
    }

    drop(introduced);
    drop(gate);
    Ok(committed)
}

/// Queue `layout` for introduction unless already introduced, preceded by
/// any layouts it references.
fn push_with_refs(
    layout: &Arc<Layout>,
    shared: &ConsumerShared,
    intro_fp: Fingerprint,
    introduced: &HashSet<Fingerprint>,
    seen: &mut HashSet<Fingerprint>,
    out: &mut Vec<Arc<Layout>>,
) {
    let fp = layout.fingerprint();
    if fp == intro_fp || introduced.contains(&fp) || !seen.insert(fp) {
        return;
    }
    for prop in layout.properties() {
        for ref_fp in layout_refs_of(prop.ty()) {
            if let Some(nested) = shared.layouts.get(ref_fp) {
                push_with_refs(&nested, shared, intro_fp, introduced, seen, out);
            }
        }
    }
    out.push(layout.clone());
}

fn layout_refs_of(ty: &PropertyType) -> Vec<Fingerprint> {
    let mut refs = Vec::new();
    collect_refs(ty, &mut refs);
    refs
}

fn collect_refs(ty: &PropertyType, out: &mut Vec<Fingerprint>) {
    match ty {
        PropertyType::List(elem) | PropertyType::Optional(elem) => collect_refs(elem, out),
        PropertyType::Map(key, value) => {
            collect_refs(key, out);
            collect_refs(value, out);
        }
        PropertyType::LayoutRef(fp) => out.push(*fp),
        _ => {}
    }
}
