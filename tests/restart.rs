//! Restart scenarios over the durable file journal.

mod common;

use std::sync::Arc;

use common::{OpenTickets, TicketOpened, TicketTypes, small_config};
use eventory::{
    FileJournal, IndexEngine, Journal, ManualTimeSource, MemoryIndexEngine, Repository,
    RepositoryBuilder, TypeName, Value,
};
use tempfile::TempDir;

fn repo_on(journal: Arc<FileJournal>, index: Arc<MemoryIndexEngine>) -> Repository {
    let repo = RepositoryBuilder::new()
        .journal(journal)
        .index_engine(index)
        .config(small_config())
        .build();
    repo.add_command_set_provider(&TicketTypes).unwrap();
    repo.add_event_set_provider(&TicketTypes).unwrap();
    repo.start().unwrap();
    repo
}

#[test]
fn s4_restart_recovers_layouts_clock_and_indices() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("tickets.evj");

    let persisted_max = {
        let journal = Arc::new(FileJournal::open(&path).unwrap());
        let index = Arc::new(MemoryIndexEngine::new());
        let repo = repo_on(journal.clone(), index.clone());
        for i in 0..5 {
            assert_eq!(
                repo.publish(OpenTickets::one(&format!("r-{i}"))).wait().unwrap(),
                1
            );
        }
        assert_eq!(index.count(TicketOpened::layout().fingerprint()), 5);
        let max = journal.latest_timestamp().unwrap().unwrap();
        repo.stop().unwrap();
        max
    };

    let journal = Arc::new(FileJournal::open(&path).unwrap());
    let index = Arc::new(MemoryIndexEngine::new());
    let repo = repo_on(journal.clone(), index.clone());

    // Layouts seen before the restart are installed again.
    let events = repo.installed_events();
    assert!(events.contains(&TypeName::new("TicketOpened").unwrap()));

    // The clock resumes above everything persisted.
    assert!(repo.get_timestamp() >= persisted_max);

    // Indices are rebuilt from the journal.
    assert_eq!(index.count(TicketOpened::layout().fingerprint()), 5);
    let hits = index
        .find_equal(
            TicketOpened::layout().fingerprint(),
            "title",
            &Value::Str("r-3".into()),
        )
        .unwrap();
    assert_eq!(hits.len(), 1);

    // And the pipeline still runs: stamps stay above the recovered max.
    assert_eq!(repo.publish(OpenTickets::one("after")).wait().unwrap(), 1);
    assert!(journal.latest_timestamp().unwrap().unwrap() > persisted_max);
    repo.stop().unwrap();
}

#[test]
fn restart_with_regressed_wall_clock_stays_monotonic() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("tickets.evj");

    let persisted_max = {
        let journal = Arc::new(FileJournal::open(&path).unwrap());
        let repo = repo_on(journal.clone(), Arc::new(MemoryIndexEngine::new()));
        repo.publish(OpenTickets::one("first")).wait().unwrap();
        let max = journal.latest_timestamp().unwrap().unwrap();
        repo.stop().unwrap();
        max
    };

    // Second process boots with a wall clock far in the past.
    let journal = Arc::new(FileJournal::open(&path).unwrap());
    let repo = RepositoryBuilder::new()
        .journal(journal.clone())
        .index_engine(Arc::new(MemoryIndexEngine::new()))
        .time_source(Arc::new(ManualTimeSource::new(1)))
        .config(small_config())
        .build();
    repo.add_command_set_provider(&TicketTypes).unwrap();
    repo.add_event_set_provider(&TicketTypes).unwrap();
    repo.start().unwrap();

    assert!(repo.get_timestamp() >= persisted_max);
    repo.publish(OpenTickets::one("second")).wait().unwrap();
    let new_max = journal.latest_timestamp().unwrap().unwrap();
    assert!(new_max > persisted_max);
    repo.stop().unwrap();
}

#[test]
fn restarted_repo_does_not_reintroduce_layouts() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("tickets.evj");

    {
        let journal = Arc::new(FileJournal::open(&path).unwrap());
        let repo = repo_on(journal, Arc::new(MemoryIndexEngine::new()));
        repo.publish(OpenTickets::one("seed")).wait().unwrap();
        repo.stop().unwrap();
    }

    let count_intros = |journal: &FileJournal| {
        journal
            .iter_entries(&eventory::EntryFilter::all())
            .unwrap()
            .filter(|e| {
                e.introduced_layout()
                    .is_some_and(|i| i.fingerprint == TicketOpened::layout().fingerprint())
            })
            .count()
    };

    let journal = Arc::new(FileJournal::open(&path).unwrap());
    let before = count_intros(&journal);
    assert_eq!(before, 1);

    let repo = repo_on(journal.clone(), Arc::new(MemoryIndexEngine::new()));
    repo.publish(OpenTickets::one("again")).wait().unwrap();
    repo.stop().unwrap();

    assert_eq!(count_intros(&journal), before);
}
