//! Repository facade: lifecycle, registration, publish entry point.
//!
//! Built explicitly (no service registry): the builder takes the journal,
//! index engine, lock provider and physical time source; `start` brings
//! them up in dependency order, recovers journal state into the clock,
//! layout registry and indices, starts the consumer, and introduces every
//! installed layout before reporting Running.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::core::{
    Command, CommandTerminatedExceptionally, EntityLayoutIntroduced, EventCausalityEstablished,
    HostErrorOccurred, HybridClock, HybridTimestamp, Layout, LayoutError, LayoutRegistry,
    PhysicalTimeSource, SystemTimeSource, TypeName,
};
use crate::index::IndexEngine;
use crate::journal::{EntryFilter, Journal};

use super::consumer::{CommandConsumer, ConsumerShared};
use super::future::{CommandFuture, command_future};
use super::introduce::IntroduceEntityLayouts;
use super::lock::{LocalLockProvider, LockProvider};
use super::subscriber::EntitySubscriber;
use super::{PublishError, RepositoryError};

/// One-way lifecycle of a repository.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
}

impl Lifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::New => "new",
            Lifecycle::Starting => "starting",
            Lifecycle::Running => "running",
            Lifecycle::Stopping => "stopping",
            Lifecycle::Terminated => "terminated",
        }
    }
}

/// An installed entity type: its layout plus declared attribute indices.
#[derive(Clone, Debug)]
pub struct TypeRegistration {
    pub name: TypeName,
    pub layout: Arc<Layout>,
    pub indices: Vec<String>,
}

impl TypeRegistration {
    pub fn new(layout: Arc<Layout>) -> Self {
        Self {
            name: layout.name().clone(),
            layout,
            indices: Vec::new(),
        }
    }

    pub fn with_index(mut self, attribute: impl Into<String>) -> Self {
        self.indices.push(attribute.into());
        self
    }
}

/// Supplies command types to install.
pub trait CommandSetProvider: Send + Sync {
    fn commands(&self) -> Vec<TypeRegistration>;
}

/// Supplies event types to install.
pub trait EventSetProvider: Send + Sync {
    fn events(&self) -> Vec<TypeRegistration>;
}

/// Explicit construction of a repository.
pub struct RepositoryBuilder {
    journal: Option<Arc<dyn Journal>>,
    index: Option<Arc<dyn IndexEngine>>,
    locks: Arc<dyn LockProvider>,
    time_source: Arc<dyn PhysicalTimeSource>,
    config: Config,
}

impl RepositoryBuilder {
    pub fn new() -> Self {
        Self {
            journal: None,
            index: None,
            locks: Arc::new(LocalLockProvider::new()),
            time_source: Arc::new(SystemTimeSource),
            config: Config::default(),
        }
    }

    pub fn journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn index_engine(mut self, index: Arc<dyn IndexEngine>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn lock_provider(mut self, locks: Arc<dyn LockProvider>) -> Self {
        self.locks = locks;
        self
    }

    pub fn time_source(mut self, source: Arc<dyn PhysicalTimeSource>) -> Self {
        self.time_source = source;
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Repository {
        Repository {
            inner: Arc::new(RepoInner {
                config: self.config,
                state: Mutex::new(Lifecycle::New),
                journal: self.journal,
                index: self.index,
                locks: self.locks,
                clock: Arc::new(HybridClock::new(self.time_source)),
                layouts: Arc::new(LayoutRegistry::new()),
                commands: Mutex::new(BTreeMap::new()),
                events: Mutex::new(BTreeMap::new()),
                subscribers: Mutex::new(Vec::new()),
                consumer: Mutex::new(None),
            }),
        }
    }
}

impl Default for RepositoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct RepoInner {
    config: Config,
    state: Mutex<Lifecycle>,
    journal: Option<Arc<dyn Journal>>,
    index: Option<Arc<dyn IndexEngine>>,
    locks: Arc<dyn LockProvider>,
    clock: Arc<HybridClock>,
    layouts: Arc<LayoutRegistry>,
    commands: Mutex<BTreeMap<TypeName, TypeRegistration>>,
    events: Mutex<BTreeMap<TypeName, TypeRegistration>>,
    subscribers: Mutex<Vec<Arc<dyn EntitySubscriber>>>,
    consumer: Mutex<Option<CommandConsumer>>,
}

/// The event-sourcing repository.
#[derive(Clone)]
pub struct Repository {
    inner: Arc<RepoInner>,
}

impl Repository {
    pub fn builder() -> RepositoryBuilder {
        RepositoryBuilder::new()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, from: Lifecycle, to: Lifecycle) -> Result<(), RepositoryError> {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != from {
            return Err(RepositoryError::IllegalState {
                reason: format!("expected {}, was {}", from.as_str(), state.as_str()),
            });
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: Lifecycle) {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }

    /// Bring the repository up: validate collaborators, recover journal
    /// state, start the consumer, introduce installed layouts. Reports
    /// Running only after the introductions are durable.
    pub fn start(&self) -> Result<(), RepositoryError> {
        self.transition(Lifecycle::New, Lifecycle::Starting)?;
        match self.start_inner() {
            Ok(()) => {
                self.set_state(Lifecycle::Running);
                tracing::info!("repository running");
                Ok(())
            }
            Err(err) => {
                self.set_state(Lifecycle::Terminated);
                Err(err)
            }
        }
    }

    fn start_inner(&self) -> Result<(), RepositoryError> {
        let journal = self
            .inner
            .journal
            .clone()
            .ok_or(RepositoryError::NotConfigured { what: "journal" })?;
        let index = self
            .inner
            .index
            .clone()
            .ok_or(RepositoryError::NotConfigured { what: "index engine" })?;

        self.install_builtins();

        // Register every installed layout, then recover layouts the
        // journal knows that the application no longer names.
        let command_regs = self.command_registrations();
        let event_regs = self.event_registrations();
        let installed: Vec<Arc<Layout>> = command_regs
            .iter()
            .chain(event_regs.iter())
            .map(|r| r.layout.clone())
            .collect();
        self.register_layouts(installed)?;
        let introduced = journal.introduced_fingerprints()?;
        self.recover_layouts(&journal)?;

        // Clock recovery: never issue a stamp at or below anything
        // already persisted.
        if let Some(max) = journal.latest_timestamp()? {
            let resumed = self.inner.clock.update(&max);
            tracing::debug!(persisted = %max, resumed = %resumed, "clock recovered from journal");
        }

        // Index configuration and rebuild from the journal.
        for reg in command_regs.iter().chain(event_regs.iter()) {
            self.configure_indices(index.as_ref(), reg)?;
        }
        self.rebuild_indices(&journal, index.as_ref());

        journal.on_commands_added(&command_regs.iter().map(|r| r.layout.clone()).collect::<Vec<_>>())?;
        journal.on_events_added(&event_regs.iter().map(|r| r.layout.clone()).collect::<Vec<_>>())?;

        let shared = Arc::new(ConsumerShared {
            clock: self.inner.clock.clone(),
            journal,
            index,
            locks: self.inner.locks.clone(),
            layouts: self.inner.layouts.clone(),
            introduced: Mutex::new(introduced.clone()),
            append_gate: Mutex::new(()),
            lock_timeout: self.inner.config.lock_timeout(),
            subscriber_budget: self.inner.config.subscriber_timeout(),
        });
        let consumer = CommandConsumer::start(
            shared,
            self.inner.config.effective_worker_count(),
            self.inner.config.queue_depth,
        )
        .map_err(RepositoryError::WorkerSpawn)?;

        // Introduce everything installed but not yet in the journal.
        let to_introduce: Vec<Arc<Layout>> = command_regs
            .iter()
            .chain(event_regs.iter())
            .map(|r| r.layout.clone())
            .filter(|l| !introduced.contains(&l.fingerprint()))
            .collect();
        let future = consumer.publish(
            IntroduceEntityLayouts::new(to_introduce),
            self.subscriber_snapshot(),
        );
        *self
            .inner
            .consumer
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(consumer);
        let count = future.wait()?;
        tracing::debug!(introduced = count, "startup layout introduction complete");
        Ok(())
    }

    /// Stop the consumer (draining queued commands) and terminate.
    pub fn stop(&self) -> Result<(), RepositoryError> {
        self.transition(Lifecycle::Running, Lifecycle::Stopping)?;
        let consumer = self
            .inner
            .consumer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut consumer) = consumer {
            consumer.stop();
        }
        self.set_state(Lifecycle::Terminated);
        tracing::info!("repository terminated");
        Ok(())
    }

    /// Publish a command. The returned future resolves with the
    /// command's output once its event stream is durable.
    pub fn publish<C: Command>(&self, command: C) -> CommandFuture<C::Output> {
        let state = self.lifecycle();
        if state != Lifecycle::Running {
            let (future, slot, _claim) = command_future();
            slot.complete(Err(PublishError::IllegalState {
                reason: format!("repository is {}", state.as_str()),
            }));
            return future;
        }
        let consumer = self
            .inner
            .consumer
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match consumer.as_ref() {
            Some(consumer) => consumer.publish(command, self.subscriber_snapshot()),
            None => {
                let (future, slot, _claim) = command_future();
                slot.complete(Err(PublishError::IllegalState {
                    reason: "consumer not running".into(),
                }));
                future
            }
        }
    }

    /// Current HLC reading without advancing the clock.
    pub fn get_timestamp(&self) -> HybridTimestamp {
        self.inner.clock.peek()
    }

    /// Monotone count of clock ticks taken without physical time.
    pub fn clock_degraded_ticks(&self) -> u64 {
        self.inner.clock.degraded_ticks()
    }

    pub fn installed_commands(&self) -> Vec<TypeName> {
        self.inner
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn installed_events(&self) -> Vec<TypeName> {
        self.inner
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn add_command_set_provider(
        &self,
        provider: &dyn CommandSetProvider,
    ) -> Result<(), RepositoryError> {
        self.install_registrations(provider.commands(), true)
    }

    pub fn remove_command_set_provider(&self, provider: &dyn CommandSetProvider) {
        let mut commands = self
            .inner
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for reg in provider.commands() {
            commands.remove(&reg.name);
        }
    }

    pub fn add_event_set_provider(
        &self,
        provider: &dyn EventSetProvider,
    ) -> Result<(), RepositoryError> {
        self.install_registrations(provider.events(), false)
    }

    pub fn remove_event_set_provider(&self, provider: &dyn EventSetProvider) {
        let mut events = self.inner.events.lock().unwrap_or_else(|e| e.into_inner());
        for reg in provider.events() {
            events.remove(&reg.name);
        }
    }

    pub fn add_entity_subscriber(&self, subscriber: Arc<dyn EntitySubscriber>) {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(subscriber);
    }

    pub fn remove_entity_subscriber(&self, subscriber: &Arc<dyn EntitySubscriber>) {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|s| !Arc::ptr_eq(s, subscriber));
    }

    fn subscriber_snapshot(&self) -> Vec<Arc<dyn EntitySubscriber>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn command_registrations(&self) -> Vec<TypeRegistration> {
        self.inner
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn event_registrations(&self) -> Vec<TypeRegistration> {
        self.inner
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn install_builtins(&self) {
        let builtin_events = [
            TypeRegistration::new(EventCausalityEstablished::layout()),
            TypeRegistration::new(CommandTerminatedExceptionally::layout()),
            TypeRegistration::new(EntityLayoutIntroduced::layout()),
            TypeRegistration::new(HostErrorOccurred::layout()),
        ];
        let mut events = self.inner.events.lock().unwrap_or_else(|e| e.into_inner());
        for reg in builtin_events {
            events.entry(reg.name.clone()).or_insert(reg);
        }
        drop(events);

        let mut commands = self
            .inner
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let intro = TypeRegistration::new(IntroduceEntityLayouts::layout());
        commands.entry(intro.name.clone()).or_insert(intro);
    }

    /// Additive type installation. While Running this configures indices
    /// and introduces the new layouts immediately; while New it only
    /// records them (start applies everything).
    fn install_registrations(
        &self,
        registrations: Vec<TypeRegistration>,
        are_commands: bool,
    ) -> Result<(), RepositoryError> {
        {
            let target = if are_commands {
                &self.inner.commands
            } else {
                &self.inner.events
            };
            let mut map = target.lock().unwrap_or_else(|e| e.into_inner());
            for reg in &registrations {
                map.insert(reg.name.clone(), reg.clone());
            }
        }

        match self.lifecycle() {
            Lifecycle::New | Lifecycle::Starting => Ok(()),
            Lifecycle::Running => self.apply_registrations(&registrations, are_commands),
            other => Err(RepositoryError::IllegalState {
                reason: format!("cannot install types while {}", other.as_str()),
            }),
        }
    }

    fn apply_registrations(
        &self,
        registrations: &[TypeRegistration],
        are_commands: bool,
    ) -> Result<(), RepositoryError> {
        let journal = self
            .inner
            .journal
            .clone()
            .ok_or(RepositoryError::NotConfigured { what: "journal" })?;
        let index = self
            .inner
            .index
            .clone()
            .ok_or(RepositoryError::NotConfigured { what: "index engine" })?;

        let layouts: Vec<Arc<Layout>> = registrations.iter().map(|r| r.layout.clone()).collect();
        self.register_layouts(layouts.clone())?;
        for reg in registrations {
            self.configure_indices(index.as_ref(), reg)?;
        }
        if are_commands {
            journal.on_commands_added(&layouts)?;
        } else {
            journal.on_events_added(&layouts)?;
        }

        let future = {
            let guard = self
                .inner
                .consumer
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            guard.as_ref().and_then(|consumer| {
                let known = consumer.introduced_snapshot();
                let to_introduce: Vec<Arc<Layout>> = layouts
                    .into_iter()
                    .filter(|l| !known.contains(&l.fingerprint()))
                    .collect();
                if to_introduce.is_empty() {
                    None
                } else {
                    Some(consumer.publish(
                        IntroduceEntityLayouts::new(to_introduce),
                        self.subscriber_snapshot(),
                    ))
                }
            })
        };
        if let Some(future) = future {
            future.wait()?;
        }
        Ok(())
    }

    /// Register a set of layouts whose internal reference order is
    /// unknown: retry the ones blocked on not-yet-registered references
    /// until a pass makes no progress.
    fn register_layouts(&self, layouts: Vec<Arc<Layout>>) -> Result<(), RepositoryError> {
        let mut pending = layouts;
        loop {
            let total = pending.len();
            let mut blocked = Vec::new();
            let mut last_blocked_err = None;
            for layout in pending {
                match self.inner.layouts.register(layout.clone()) {
                    Ok(_) => {}
                    Err(err @ LayoutError::UnknownReference { .. }) => {
                        last_blocked_err = Some(err);
                        blocked.push(layout);
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            match last_blocked_err {
                None => return Ok(()),
                // No forward progress: a reference is genuinely missing.
                Some(err) if blocked.len() == total => return Err(err.into()),
                Some(_) => pending = blocked,
            }
        }
    }

    fn configure_indices(
        &self,
        index: &dyn IndexEngine,
        reg: &TypeRegistration,
    ) -> Result<(), RepositoryError> {
        index
            .register_collection(&reg.layout)
            .map_err(|e| RepositoryError::IllegalState {
                reason: format!("index registration for `{}` failed: {e}", reg.name),
            })?;
        for attribute in &reg.indices {
            // AlreadyPresent is fine: re-registration is idempotent.
            index
                .try_add_index(reg.layout.fingerprint(), attribute)
                .map_err(|e| RepositoryError::IllegalState {
                    reason: format!("index `{}` on `{}` failed: {e}", attribute, reg.name),
                })?;
        }
        Ok(())
    }

    fn recover_layouts(&self, journal: &Arc<dyn Journal>) -> Result<(), RepositoryError> {
        let filter =
            EntryFilter::events().with_fingerprint(EntityLayoutIntroduced::layout().fingerprint());
        for entry in journal.iter_entries(&filter)? {
            let Some(intro) = entry.introduced_layout() else {
                continue;
            };
            if self.inner.layouts.contains(intro.fingerprint) {
                continue;
            }
            let name = format!("recovered:{}", intro.fingerprint.short_hex());
            let Ok(name) = TypeName::new(name) else {
                continue;
            };
            match Layout::from_canonical_bytes(name, &intro.schema) {
                Ok(layout) => {
                    if layout.fingerprint() != intro.fingerprint {
                        tracing::warn!(
                            claimed = %intro.fingerprint,
                            actual = %layout.fingerprint(),
                            "introduction schema does not hash to its fingerprint; skipping"
                        );
                        continue;
                    }
                    if let Err(err) = self.inner.layouts.register(layout) {
                        tracing::warn!(error = %err, "failed to register recovered layout");
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, fingerprint = %intro.fingerprint, "unparseable introduced schema");
                }
            }
        }
        Ok(())
    }

    fn rebuild_indices(&self, journal: &Arc<dyn Journal>, index: &dyn IndexEngine) {
        let entries = match journal.iter_entries(&EntryFilter::all()) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = %err, "index rebuild skipped: journal iteration failed");
                return;
            }
        };
        let layouts = self.inner.layouts.snapshot();
        let mut rebuilt = 0usize;
        let mut skipped = 0usize;
        for entry in entries {
            match entry.decode_record(&layouts) {
                Ok(record) => {
                    if let Err(err) = index.add_to_collection(&record) {
                        tracing::warn!(error = %err, id = %entry.id, "index rebuild insert failed");
                    } else {
                        rebuilt += 1;
                    }
                }
                Err(err) => {
                    skipped += 1;
                    tracing::debug!(error = %err, id = %entry.id, "undecodable entry during rebuild");
                }
            }
        }
        if rebuilt > 0 || skipped > 0 {
            tracing::debug!(rebuilt, skipped, "index rebuild complete");
        }
    }
}
