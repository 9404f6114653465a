//! End-to-end command pipeline scenarios over the memory journal.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{OpenTickets, TicketOpened, small_config, started_repo};
use eventory::core::LayoutSnapshot;
use eventory::{
    CommittedEntity, EntityLayoutIntroduced, EntitySubscriber, EventCausalityEstablished,
    Fingerprint, IndexEngine, IntroduceEntityLayouts, Journal, JournalEntry, JournalError,
    JournalTx, LayoutBuilder, LayoutRegistry, MemoryIndexEngine, MemoryJournal, PropertyType,
    PublishError, RepositoryBuilder, TypeName, Value,
};

fn full_snapshot() -> LayoutSnapshot {
    let registry = LayoutRegistry::new();
    for layout in [
        EventCausalityEstablished::layout(),
        EntityLayoutIntroduced::layout(),
        eventory::CommandTerminatedExceptionally::layout(),
        eventory::HostErrorOccurred::layout(),
        IntroduceEntityLayouts::layout(),
        OpenTickets::layout(),
        TicketOpened::layout(),
    ] {
        registry.register(layout).unwrap();
    }
    registry.snapshot()
}

fn all_entries(journal: &MemoryJournal) -> Vec<JournalEntry> {
    journal
        .iter_entries(&eventory::EntryFilter::all())
        .unwrap()
        .collect()
}

fn count_of(entries: &[JournalEntry], fingerprint: Fingerprint) -> usize {
    entries
        .iter()
        .filter(|e| e.fingerprint == fingerprint)
        .count()
}

fn assert_stamps_strictly_increasing(entries: &[JournalEntry]) {
    for pair in entries.windows(2) {
        assert!(
            pair[0].at < pair[1].at,
            "journal stamps not strictly increasing: {} then {}",
            pair[0].at,
            pair[1].at
        );
    }
}

#[test]
fn s1_monotonicity_under_concurrency() {
    let fx = started_repo(small_config());
    let mut handles = Vec::new();
    for i in 0..100 {
        let repo = fx.repo.clone();
        handles.push(std::thread::spawn(move || {
            repo.publish(OpenTickets::one(&format!("t-{i}"))).wait()
        }));
    }
    for handle in handles {
        assert_eq!(handle.join().unwrap().unwrap(), 1);
    }

    let entries = all_entries(&fx.journal);
    assert_eq!(count_of(&entries, OpenTickets::layout().fingerprint()), 100);
    assert_eq!(count_of(&entries, TicketOpened::layout().fingerprint()), 100);
    assert_stamps_strictly_increasing(&entries);

    // Strict consistency after publish: every event is queryable.
    assert_eq!(fx.index.count(TicketOpened::layout().fingerprint()), 100);
}

#[test]
fn s2_host_failure_capture() {
    let fx = started_repo(small_config());
    let err = fx
        .repo
        .publish(OpenTickets::many(3, "x").failing_after(1))
        .wait()
        .unwrap_err();
    match err {
        PublishError::Host(host) => {
            assert_eq!(host.kind, "TicketJamError");
            assert_eq!(host.message, "printer on fire");
        }
        other => panic!("expected Host failure, got {other:?}"),
    }

    let entries = all_entries(&fx.journal);
    assert_eq!(count_of(&entries, OpenTickets::layout().fingerprint()), 1);
    assert_eq!(
        count_of(
            &entries,
            eventory::CommandTerminatedExceptionally::layout().fingerprint()
        ),
        1
    );
    assert_eq!(
        count_of(&entries, eventory::HostErrorOccurred::layout().fingerprint()),
        1
    );
    // The user event yielded before the failure was abandoned.
    assert_eq!(count_of(&entries, TicketOpened::layout().fingerprint()), 0);
    assert_eq!(fx.index.count(TicketOpened::layout().fingerprint()), 0);
}

#[test]
fn s3_lock_contention_serializes() {
    let fx = started_repo(small_config());
    let first = fx
        .repo
        .publish(OpenTickets::one("held").with_lock("x").with_delay_ms(150));
    std::thread::sleep(Duration::from_millis(50));
    let second = fx.repo.publish(OpenTickets::one("waited").with_lock("x"));

    assert_eq!(second.wait().unwrap(), 1);
    assert_eq!(first.wait().unwrap(), 1);

    // The first command's whole batch committed before the second's.
    let snapshot = full_snapshot();
    let entries = all_entries(&fx.journal);
    let position_of = |title: &str| {
        entries.iter().position(|e| {
            e.fingerprint == TicketOpened::layout().fingerprint()
                && e.decode_record(&snapshot)
                    .unwrap()
                    .property("title")
                    .and_then(Value::as_str)
                    == Some(title)
        })
    };
    let held = position_of("held").expect("first ticket journaled");
    let waited = position_of("waited").expect("second ticket journaled");
    assert!(held < waited);
}

#[test]
fn s3_lock_timeout_fails_command() {
    let mut config = small_config();
    config.lock_timeout_ms = 1;
    let fx = started_repo(config);

    let first = fx
        .repo
        .publish(OpenTickets::one("held").with_lock("x").with_delay_ms(200));
    std::thread::sleep(Duration::from_millis(50));
    let second = fx.repo.publish(OpenTickets::one("starved").with_lock("x"));

    match second.wait().unwrap_err() {
        PublishError::LockTimeout { name, timeout_ms } => {
            assert_eq!(name.as_str(), "x");
            assert_eq!(timeout_ms, 1);
        }
        other => panic!("expected LockTimeout, got {other:?}"),
    }
    assert_eq!(first.wait().unwrap(), 1);

    // Nothing from the starved command is observable anywhere.
    let entries = all_entries(&fx.journal);
    assert_eq!(count_of(&entries, TicketOpened::layout().fingerprint()), 1);
    assert_eq!(count_of(&entries, OpenTickets::layout().fingerprint()), 1);
    assert_eq!(fx.index.count(TicketOpened::layout().fingerprint()), 1);
}

#[test]
fn s5_fingerprints_stable_across_type_names() {
    let a = LayoutBuilder::new(TypeName::new("InvoiceRaised").unwrap())
        .property("priority", PropertyType::I32)
        .property("title", PropertyType::Str)
        .finish()
        .unwrap();
    assert_eq!(a.fingerprint(), TicketOpened::layout().fingerprint());
}

struct CollectTitles(Mutex<Vec<String>>);

impl EntitySubscriber for CollectTitles {
    fn on_entity(&self, entity: &CommittedEntity) {
        if entity.record.fingerprint() == TicketOpened::layout().fingerprint()
            && let Some(title) = entity.record.property("title").and_then(Value::as_str)
        {
            self.0.lock().unwrap().push(title.to_string());
        }
    }
}

struct AlwaysPanics;

impl EntitySubscriber for AlwaysPanics {
    fn on_entity(&self, _: &CommittedEntity) {
        panic!("misbehaving subscriber");
    }
}

#[test]
fn s6_subscriber_isolation() {
    let fx = started_repo(small_config());
    let left = Arc::new(CollectTitles(Mutex::new(Vec::new())));
    let right = Arc::new(CollectTitles(Mutex::new(Vec::new())));
    fx.repo.add_entity_subscriber(left.clone());
    fx.repo.add_entity_subscriber(Arc::new(AlwaysPanics));
    fx.repo.add_entity_subscriber(right.clone());

    let opened = fx.repo.publish(OpenTickets::many(3, "s6")).wait().unwrap();
    assert_eq!(opened, 3);

    let expected = ["s6-0", "s6-1", "s6-2"];
    assert_eq!(*left.0.lock().unwrap(), expected);
    assert_eq!(*right.0.lock().unwrap(), expected);
}

#[test]
fn causality_edges_precede_their_events() {
    let fx = started_repo(small_config());
    fx.repo.publish(OpenTickets::many(3, "c")).wait().unwrap();
    fx.repo.publish(OpenTickets::one("d")).wait().unwrap();

    let snapshot = full_snapshot();
    let entries = all_entries(&fx.journal);
    let edge_fp = EventCausalityEstablished::layout().fingerprint();
    let ticket_fp = TicketOpened::layout().fingerprint();

    for (position, entry) in entries.iter().enumerate() {
        if entry.fingerprint != ticket_fp {
            continue;
        }
        let command = entry.cause.expect("user event attributed to a command");
        let edge_position = entries[..position]
            .iter()
            .position(|candidate| {
                candidate.fingerprint == edge_fp
                    && candidate
                        .decode_record(&snapshot)
                        .ok()
                        .and_then(|r| EventCausalityEstablished::from_record(&r))
                        .is_some_and(|edge| edge.event == entry.id && edge.cause == command)
            })
            .expect("causality edge journaled before its event");
        assert!(edge_position < position);
    }
}

#[test]
fn introductions_precede_first_use() {
    let fx = started_repo(small_config());
    fx.repo.publish(OpenTickets::many(2, "i")).wait().unwrap();

    let entries = all_entries(&fx.journal);
    let intro_fp = EntityLayoutIntroduced::layout().fingerprint();
    let mut introduced = std::collections::HashSet::from([intro_fp]);
    for entry in &entries {
        assert!(
            introduced.contains(&entry.fingerprint),
            "fingerprint {} used before introduction",
            entry.fingerprint
        );
        if let Some(intro) = entry.introduced_layout() {
            introduced.insert(intro.fingerprint);
        }
    }
}

#[test]
fn cancellation_only_while_queued() {
    let mut config = small_config();
    config.worker_count = 1;
    let fx = started_repo(config);

    let blocker = fx
        .repo
        .publish(OpenTickets::one("slow").with_delay_ms(200));
    let queued = fx.repo.publish(OpenTickets::one("fast"));
    assert!(queued.cancel(), "queued command must be cancellable");
    assert!(matches!(
        queued.wait().unwrap_err(),
        PublishError::Cancelled
    ));
    assert_eq!(blocker.wait().unwrap(), 1);

    let entries = all_entries(&fx.journal);
    assert_eq!(count_of(&entries, TicketOpened::layout().fingerprint()), 1);

    // Once resolved, cancellation is refused.
    let done = fx.repo.publish(OpenTickets::one("later"));
    let mut resolved = None;
    for _ in 0..100 {
        if let Some(result) = done.wait_timeout(Duration::from_millis(50)) {
            resolved = Some(result);
            break;
        }
    }
    assert_eq!(resolved.unwrap().unwrap(), 1);
    assert!(!done.cancel());
}

#[test]
fn publish_before_start_is_illegal_state() {
    let repo = RepositoryBuilder::new()
        .journal(Arc::new(MemoryJournal::new()))
        .index_engine(Arc::new(MemoryIndexEngine::new()))
        .build();
    let err = repo.publish(OpenTickets::one("early")).wait().unwrap_err();
    assert!(matches!(err, PublishError::IllegalState { .. }));
}

struct FailingJournal {
    inner: MemoryJournal,
    fail_commits: AtomicBool,
}

impl FailingJournal {
    fn new() -> Self {
        Self {
            inner: MemoryJournal::new(),
            fail_commits: AtomicBool::new(false),
        }
    }
}

struct FailingTx<'a> {
    inner: Box<dyn JournalTx + 'a>,
    fail: bool,
}

impl JournalTx for FailingTx<'_> {
    fn append_command(&mut self, entry: JournalEntry) -> Result<(), JournalError> {
        self.inner.append_command(entry)
    }

    fn append_event(&mut self, entry: JournalEntry) -> Result<(), JournalError> {
        self.inner.append_event(entry)
    }

    fn commit(self: Box<Self>) -> Result<(), JournalError> {
        let this = *self;
        if this.fail {
            this.inner.abort();
            return Err(JournalError::Io(std::io::Error::other(
                "injected commit failure",
            )));
        }
        this.inner.commit()
    }

    fn abort(self: Box<Self>) {
        let this = *self;
        this.inner.abort();
    }
}

impl Journal for FailingJournal {
    fn begin(&self) -> Result<Box<dyn JournalTx + '_>, JournalError> {
        Ok(Box::new(FailingTx {
            inner: self.inner.begin()?,
            fail: self.fail_commits.load(Ordering::SeqCst),
        }))
    }

    fn on_commands_added(
        &self,
        layouts: &[Arc<eventory::Layout>],
    ) -> Result<(), JournalError> {
        self.inner.on_commands_added(layouts)
    }

    fn on_events_added(&self, layouts: &[Arc<eventory::Layout>]) -> Result<(), JournalError> {
        self.inner.on_events_added(layouts)
    }

    fn iter_entries(
        &self,
        filter: &eventory::EntryFilter,
    ) -> Result<Box<dyn Iterator<Item = JournalEntry> + Send>, JournalError> {
        self.inner.iter_entries(filter)
    }

    fn introduced_fingerprints(
        &self,
    ) -> Result<std::collections::HashSet<Fingerprint>, JournalError> {
        self.inner.introduced_fingerprints()
    }

    fn latest_timestamp(&self) -> Result<Option<eventory::HybridTimestamp>, JournalError> {
        self.inner.latest_timestamp()
    }

    fn entry_count(&self) -> Result<usize, JournalError> {
        self.inner.entry_count()
    }
}

#[test]
fn journal_commit_failure_leaves_no_trace_and_releases_locks() {
    let journal = Arc::new(FailingJournal::new());
    let index = Arc::new(MemoryIndexEngine::new());
    let repo = RepositoryBuilder::new()
        .journal(journal.clone())
        .index_engine(index.clone())
        .config(small_config())
        .build();
    repo.add_command_set_provider(&common::TicketTypes).unwrap();
    repo.add_event_set_provider(&common::TicketTypes).unwrap();
    repo.start().unwrap();

    let before = journal.entry_count().unwrap();
    journal.fail_commits.store(true, Ordering::SeqCst);
    let err = repo
        .publish(OpenTickets::one("doomed").with_lock("x"))
        .wait()
        .unwrap_err();
    assert!(matches!(err, PublishError::Journal(_)));
    assert_eq!(journal.entry_count().unwrap(), before);
    assert_eq!(index.count(TicketOpened::layout().fingerprint()), 0);

    // Locks were released on the failure path.
    journal.fail_commits.store(false, Ordering::SeqCst);
    let opened = repo
        .publish(OpenTickets::one("survivor").with_lock("x"))
        .wait()
        .unwrap();
    assert_eq!(opened, 1);
    assert_eq!(index.count(TicketOpened::layout().fingerprint()), 1);
}

#[test]
fn indexed_attribute_queries_work_after_publish() {
    let fx = started_repo(small_config());
    fx.repo.publish(OpenTickets::one("alpha")).wait().unwrap();
    fx.repo.publish(OpenTickets::one("beta")).wait().unwrap();

    let hits = fx
        .index
        .find_equal(
            TicketOpened::layout().fingerprint(),
            "title",
            &Value::Str("beta".into()),
        )
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(
        hits[0].property("priority").and_then(Value::as_i64),
        Some(3)
    );
}
