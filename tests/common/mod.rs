//! Shared fixtures for integration tests: a ticket-tracking domain with
//! one event type and one configurable command.

// Each test binary uses a different slice of the fixture.
#![allow(dead_code)]

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use eventory::{
    Command, CommandSetProvider, Config, Entity, Event, EventSetProvider, EventStream, HostError,
    Layout, LayoutBuilder, LockName, MemoryIndexEngine, MemoryJournal, PropertyType, Repository,
    RepositoryBuilder, TypeName, TypeRegistration, Value,
};

/// A ticket was opened.
#[derive(Clone, Debug, PartialEq)]
pub struct TicketOpened {
    pub title: String,
    pub priority: i32,
}

impl TicketOpened {
    pub fn layout() -> Arc<Layout> {
        static LAYOUT: OnceLock<Arc<Layout>> = OnceLock::new();
        LAYOUT
            .get_or_init(|| {
                LayoutBuilder::new(TypeName::new("TicketOpened").unwrap())
                    .property("priority", PropertyType::I32)
                    .property("title", PropertyType::Str)
                    .finish()
                    .unwrap()
            })
            .clone()
    }
}

impl Entity for TicketOpened {
    fn layout(&self) -> Arc<Layout> {
        Self::layout()
    }

    fn values(&self) -> Vec<Value> {
        vec![Value::I32(self.priority), Value::Str(self.title.clone())]
    }
}

impl Event for TicketOpened {}

/// Open one ticket per title. The knobs (`lock`, `delay_ms`,
/// `fail_after`) drive the concurrency and failure scenarios; only the
/// titles are part of the persisted payload.
#[derive(Clone, Debug, Default)]
pub struct OpenTickets {
    pub titles: Vec<String>,
    pub lock: Option<String>,
    pub delay_ms: u64,
    pub fail_after: Option<usize>,
}

impl OpenTickets {
    pub fn one(title: &str) -> Self {
        Self {
            titles: vec![title.to_string()],
            ..Self::default()
        }
    }

    pub fn many(count: usize, prefix: &str) -> Self {
        Self {
            titles: (0..count).map(|i| format!("{prefix}-{i}")).collect(),
            ..Self::default()
        }
    }

    pub fn with_lock(mut self, lock: &str) -> Self {
        self.lock = Some(lock.to_string());
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn failing_after(mut self, yielded: usize) -> Self {
        self.fail_after = Some(yielded);
        self
    }

    pub fn layout() -> Arc<Layout> {
        static LAYOUT: OnceLock<Arc<Layout>> = OnceLock::new();
        LAYOUT
            .get_or_init(|| {
                LayoutBuilder::new(TypeName::new("OpenTickets").unwrap())
                    .property("titles", PropertyType::list(PropertyType::Str))
                    .finish()
                    .unwrap()
            })
            .clone()
    }
}

impl Entity for OpenTickets {
    fn layout(&self) -> Arc<Layout> {
        Self::layout()
    }

    fn values(&self) -> Vec<Value> {
        vec![Value::List(
            self.titles
                .iter()
                .map(|t| Value::Str(t.clone()))
                .collect(),
        )]
    }
}

impl Command for OpenTickets {
    /// Tickets opened so far.
    type State = u32;
    type Output = u32;

    fn locks(&self) -> Vec<LockName> {
        self.lock
            .iter()
            .map(|l| LockName::new(l.clone()).unwrap())
            .collect()
    }

    fn execute(&self) -> Result<EventStream<Self::State>, HostError> {
        let titles = self.titles.clone();
        let delay_ms = self.delay_ms;
        let fail_after = self.fail_after;
        let mut position = 0usize;
        let mut slept = false;
        Ok(EventStream::new(0u32, move |count| {
            if !slept {
                slept = true;
                if delay_ms > 0 {
                    std::thread::sleep(Duration::from_millis(delay_ms));
                }
            }
            if fail_after == Some(position) {
                position += 1;
                return Some(Err(HostError::new("TicketJamError", "printer on fire")));
            }
            let title = titles.get(position)?.clone();
            position += 1;
            *count += 1;
            Some(Ok(Box::new(TicketOpened { title, priority: 3 }) as Box<dyn Event>))
        }))
    }

    fn result(&self, state: Self::State) -> Self::Output {
        state
    }
}

pub struct TicketTypes;

impl CommandSetProvider for TicketTypes {
    fn commands(&self) -> Vec<TypeRegistration> {
        vec![TypeRegistration::new(OpenTickets::layout())]
    }
}

impl EventSetProvider for TicketTypes {
    fn events(&self) -> Vec<TypeRegistration> {
        vec![TypeRegistration::new(TicketOpened::layout()).with_index("title")]
    }
}

pub struct Fixture {
    pub repo: Repository,
    pub journal: Arc<MemoryJournal>,
    pub index: Arc<MemoryIndexEngine>,
}

/// Repository over a memory journal, started with the ticket types
/// installed.
pub fn started_repo(config: Config) -> Fixture {
    let journal = Arc::new(MemoryJournal::new());
    let index = Arc::new(MemoryIndexEngine::new());
    let repo = RepositoryBuilder::new()
        .journal(journal.clone())
        .index_engine(index.clone())
        .config(config)
        .build();
    repo.add_command_set_provider(&TicketTypes).unwrap();
    repo.add_event_set_provider(&TicketTypes).unwrap();
    repo.start().unwrap();
    Fixture {
        repo,
        journal,
        index,
    }
}

pub fn small_config() -> Config {
    Config {
        worker_count: 4,
        queue_depth: 256,
        ..Config::default()
    }
}
