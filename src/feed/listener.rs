//! Change-feed listener: one tail on the change log, shared by every
//! live query of a store.
//!
//! A dedicated worker thread owns the connection and the subscription
//! registry. Callers never touch the registry directly; `listen` and
//! [`Subscription::dispose`] enqueue commands that the worker applies
//! between entries. Entries are dispatched serially, in log order.

use crate::config::ListenerConfig;
use crate::error::{LiveError, Result};
use crate::feed::source::{ChangeLogSource, ChangeStream};
use crate::feed::types::{
    ListenerDiagnostics, ListenerEvent, ListenerState, OperationHandler, SubscriptionId,
};
use crate::store::DocumentStore;
use crate::types::{ChangeEntry, Namespace, Timestamp};
use crossbeam_channel::{after, bounded, select, tick, unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

enum Command {
    Add {
        id: SubscriptionId,
        namespace: Namespace,
        handler: Arc<dyn OperationHandler>,
    },
    Remove(SubscriptionId),
    Connect,
    Shutdown,
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Connect,
    Shutdown,
}

type Registry = HashMap<Namespace, Vec<(SubscriptionId, Arc<dyn OperationHandler>)>>;

struct Status {
    state: ListenerState,
    /// Number of finished connection attempts.
    attempts: u64,
    /// Outcome of the most recent attempt.
    last_outcome: std::result::Result<(), String>,
    shutdown: bool,
}

struct Shared {
    status: Mutex<Status>,
    status_changed: Condvar,
    /// Written only by the worker thread.
    registry: RwLock<Registry>,
    diagnostics: Mutex<ListenerDiagnostics>,
    events: Mutex<Vec<Sender<ListenerEvent>>>,
}

impl Shared {
    fn set_state(&self, state: ListenerState) {
        self.status.lock().state = state;
        self.status_changed.notify_all();
    }

    /// Record the end of a connection attempt and wake every `start` caller.
    fn finish_attempt(&self, state: ListenerState, outcome: std::result::Result<(), String>) {
        {
            let mut status = self.status.lock();
            status.state = state;
            status.attempts += 1;
            status.last_outcome = outcome;
        }
        self.status_changed.notify_all();
    }

    fn publish(&self, event: ListenerEvent) {
        // A full receiver misses the event; a dropped one is forgotten.
        self.events.lock().retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) | Err(crossbeam_channel::TrySendError::Full(_)) => true,
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
        });
    }

    fn subscription_count(&self) -> usize {
        self.registry.read().values().map(Vec::len).sum()
    }
}

/// Handle to a registered subscription.
///
/// Disposing (explicitly or by dropping the handle) removes only this
/// subscription; the shared connection stays up.
#[must_use = "dropping a Subscription disposes it"]
pub struct Subscription {
    id: SubscriptionId,
    namespace: Namespace,
    commands: Sender<Command>,
    disposed: AtomicBool,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Remove this subscription. Idempotent.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            // A listener that already shut down has nothing to remove.
            let _ = self.commands.send(Command::Remove(self.id));
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .finish()
    }
}

/// Tails a change log and dispatches entries to subscriptions by namespace.
pub struct ChangeFeedListener {
    shared: Arc<Shared>,
    commands: Sender<Command>,
    next_id: AtomicU64,
    event_buffer: usize,
    worker_id: ThreadId,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeFeedListener {
    /// Create a listener. No connection is made until [`start`](Self::start)
    /// or the first [`listen`](Self::listen).
    ///
    /// `store` serves point lookups for partial-update entries.
    pub fn new(
        source: Arc<dyn ChangeLogSource>,
        store: Arc<dyn DocumentStore>,
        config: ListenerConfig,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            status: Mutex::new(Status {
                state: ListenerState::Disconnected,
                attempts: 0,
                last_outcome: Ok(()),
                shutdown: false,
            }),
            status_changed: Condvar::new(),
            registry: RwLock::new(HashMap::new()),
            diagnostics: Mutex::new(ListenerDiagnostics::default()),
            events: Mutex::new(Vec::new()),
        });
        let (commands, command_rx) = unbounded();
        let event_buffer = config.event_buffer;

        let worker = Worker {
            shared: Arc::clone(&shared),
            source,
            store,
            commands: command_rx,
            receive_warning: WarnThrottle::new(config.warn_interval),
            dispatch_warning: WarnThrottle::new(config.warn_interval),
            config,
            connected_before: false,
        };
        let handle = thread::Builder::new()
            .name("livequery-listener".into())
            .spawn(move || worker.run())?;

        Ok(Self {
            shared,
            commands,
            next_id: AtomicU64::new(1),
            event_buffer,
            worker_id: handle.thread().id(),
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Open the change stream unless already tailing.
    ///
    /// Blocks until the pending connection attempt finishes; every caller
    /// waiting on the same attempt gets the same outcome. On failure the
    /// listener keeps retrying in the background.
    ///
    /// From a subscription handler (the worker thread) this never waits and
    /// returns [`LiveError::NotConnected`] unless already tailing.
    pub fn start(&self) -> Result<()> {
        let mut status = self.shared.status.lock();
        if status.shutdown {
            return Err(LiveError::ListenerShutdown);
        }
        if status.state == ListenerState::Tailing {
            return Ok(());
        }
        if status.state == ListenerState::Disconnected {
            status.state = ListenerState::Connecting;
            self.commands
                .send(Command::Connect)
                .map_err(|_| LiveError::ListenerShutdown)?;
        }
        if thread::current().id() == self.worker_id {
            return Err(LiveError::NotConnected);
        }

        let attempts = status.attempts;
        while status.attempts == attempts && !status.shutdown {
            self.shared.status_changed.wait(&mut status);
        }
        if status.shutdown {
            return Err(LiveError::ListenerShutdown);
        }
        status.last_outcome.clone().map_err(LiveError::Connection)
    }

    /// Register `handler` for entries of `namespace`.
    ///
    /// Registration is applied asynchronously by the worker, but always
    /// before any entry the worker receives after this call returns.
    pub fn listen(&self, namespace: Namespace, handler: Arc<dyn OperationHandler>) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        debug!(namespace = %namespace, id = id.0, "registering subscription");

        let _ = self.commands.send(Command::Add {
            id,
            namespace: namespace.clone(),
            handler,
        });
        self.connect_in_background();

        Subscription {
            id,
            namespace,
            commands: self.commands.clone(),
            disposed: AtomicBool::new(false),
        }
    }

    fn connect_in_background(&self) {
        let mut status = self.shared.status.lock();
        if status.state == ListenerState::Disconnected && !status.shutdown {
            status.state = ListenerState::Connecting;
            let _ = self.commands.send(Command::Connect);
        }
    }

    pub fn state(&self) -> ListenerState {
        self.shared.status.lock().state
    }

    /// Receive listener events. Each call returns an independent receiver.
    pub fn events(&self) -> Receiver<ListenerEvent> {
        let (tx, rx) = bounded(self.event_buffer);
        self.shared.events.lock().push(tx);
        rx
    }

    pub fn diagnostics(&self) -> ListenerDiagnostics {
        self.shared.diagnostics.lock().clone()
    }

    /// Number of registered subscriptions (as applied by the worker).
    pub fn subscription_count(&self) -> usize {
        self.shared.subscription_count()
    }

    pub fn subscriptions_by_namespace(&self) -> HashMap<Namespace, usize> {
        self.shared
            .registry
            .read()
            .iter()
            .map(|(ns, subs)| (ns.clone(), subs.len()))
            .collect()
    }

    /// Stop the worker and drop the connection. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("change feed listener thread panicked");
            }
        }
    }
}

impl Drop for ChangeFeedListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Phase {
    Idle,
    Connect,
    Tailing(ChangeStream),
    Backoff(Receiver<Instant>),
}

/// What woke the worker up.
enum Step {
    Command(Option<Command>),
    Entry(Option<Result<ChangeEntry>>),
    Tick,
    Timer,
}

/// Rate limiter for repeated warnings.
struct WarnThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl WarnThrottle {
    fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    source: Arc<dyn ChangeLogSource>,
    store: Arc<dyn DocumentStore>,
    commands: Receiver<Command>,
    config: ListenerConfig,
    receive_warning: WarnThrottle,
    dispatch_warning: WarnThrottle,
    connected_before: bool,
}

impl Worker {
    fn run(mut self) {
        let commands = self.commands.clone();
        let ticker = tick(self.config.tick_interval);
        let mut phase = Phase::Idle;

        loop {
            phase = match phase {
                Phase::Idle => match commands.recv() {
                    Ok(cmd) => match self.apply(cmd) {
                        Flow::Continue => Phase::Idle,
                        Flow::Connect => Phase::Connect,
                        Flow::Shutdown => break,
                    },
                    Err(_) => break,
                },
                Phase::Connect => self.connect(),
                Phase::Tailing(stream) => {
                    let step = select! {
                        recv(commands) -> cmd => Step::Command(cmd.ok()),
                        recv(stream) -> item => Step::Entry(item.ok()),
                        recv(ticker) -> _ => Step::Tick,
                    };
                    match step {
                        Step::Command(Some(cmd)) => match self.apply(cmd) {
                            Flow::Shutdown => break,
                            _ => Phase::Tailing(stream),
                        },
                        Step::Command(None) => break,
                        Step::Entry(Some(Ok(entry))) => {
                            // Registrations issued before this entry was
                            // written must see it.
                            if !self.drain_commands() {
                                break;
                            }
                            self.dispatch(entry);
                            Phase::Tailing(stream)
                        }
                        Step::Entry(Some(Err(e))) => self.connection_lost(e.to_string()),
                        Step::Entry(None) => self.connection_lost("change stream closed".to_string()),
                        Step::Tick | Step::Timer => {
                            self.tick();
                            Phase::Tailing(stream)
                        }
                    }
                }
                Phase::Backoff(timer) => {
                    let step = select! {
                        recv(commands) -> cmd => Step::Command(cmd.ok()),
                        recv(timer) -> _ => Step::Timer,
                    };
                    match step {
                        Step::Command(Some(cmd)) => match self.apply(cmd) {
                            Flow::Shutdown => break,
                            _ => Phase::Backoff(timer),
                        },
                        Step::Command(None) => break,
                        _ => Phase::Connect,
                    }
                }
            };
        }

        {
            let mut status = self.shared.status.lock();
            status.state = ListenerState::Disconnected;
            status.shutdown = true;
        }
        self.shared.status_changed.notify_all();
        info!("change feed listener stopped");
    }

    fn apply(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Add {
                id,
                namespace,
                handler,
            } => {
                self.shared
                    .registry
                    .write()
                    .entry(namespace)
                    .or_default()
                    .push((id, handler));
                Flow::Continue
            }
            Command::Remove(id) => {
                let mut registry = self.shared.registry.write();
                for subs in registry.values_mut() {
                    subs.retain(|(sub_id, _)| *sub_id != id);
                }
                registry.retain(|_, subs| !subs.is_empty());
                Flow::Continue
            }
            Command::Connect => Flow::Connect,
            Command::Shutdown => Flow::Shutdown,
        }
    }

    /// Apply queued commands. Returns false on shutdown.
    fn drain_commands(&mut self) -> bool {
        while let Ok(cmd) = self.commands.try_recv() {
            if self.apply(cmd) == Flow::Shutdown {
                return false;
            }
        }
        true
    }

    fn connect(&mut self) -> Phase {
        self.shared.set_state(ListenerState::Connecting);
        info!("connecting to change stream");

        match self.source.tail() {
            Ok(stream) => {
                self.shared.finish_attempt(ListenerState::Tailing, Ok(()));
                if self.connected_before {
                    let subscriptions = self.shared.subscription_count();
                    info!(subscriptions, "reconnected to change stream, restoring subscriptions");
                    self.shared.publish(ListenerEvent::Reconnected { subscriptions });
                    self.shared.diagnostics.lock().reconnects += 1;
                } else {
                    info!("connected to change stream");
                    self.shared.publish(ListenerEvent::Connected);
                }
                self.connected_before = true;
                Phase::Tailing(stream)
            }
            Err(e) => {
                let retry_in = self.config.backoff.next_delay();
                warn!(error = %e, retry_in_ms = retry_in.as_millis() as u64, "failed to open change stream");
                self.shared
                    .finish_attempt(ListenerState::Backoff, Err(e.to_string()));
                self.shared.publish(ListenerEvent::ConnectFailed {
                    error: e.to_string(),
                    retry_in,
                });
                Phase::Backoff(after(retry_in))
            }
        }
    }

    fn connection_lost(&mut self, error: String) -> Phase {
        let retry_in = self.config.backoff.next_delay();
        warn!(error = %error, retry_in_ms = retry_in.as_millis() as u64, "error in change stream listener");
        self.shared.set_state(ListenerState::Backoff);
        self.shared.publish(ListenerEvent::Disconnected { error });
        Phase::Backoff(after(retry_in))
    }

    fn dispatch(&mut self, entry: ChangeEntry) {
        let received = Timestamp::now();
        let started = Instant::now();
        let threshold = self.config.latency_threshold;

        let lag = entry.timestamp.elapsed_until(received);
        {
            let mut diag = self.shared.diagnostics.lock();
            diag.entries_received += 1;
            diag.last_receive_lag = Some(lag);
        }
        if lag > threshold {
            if self.receive_warning.ready() {
                warn!(
                    namespace = %entry.namespace,
                    lag_ms = lag.as_millis() as u64,
                    "change entry received later than latency threshold"
                );
            }
            self.shared.publish(ListenerEvent::SlowEntry {
                namespace: entry.namespace.clone(),
                lag,
            });
        }

        let handlers: Vec<Arc<dyn OperationHandler>> = match self.shared.registry.read().get(&entry.namespace) {
            Some(subs) => subs.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return,
        };

        let entry = if entry.is_partial() {
            match self.resolve(entry) {
                Some(entry) => entry,
                None => return,
            }
        } else {
            entry
        };

        for handler in &handlers {
            handler.on_operation(&entry);
        }

        let elapsed = started.elapsed();
        {
            let mut diag = self.shared.diagnostics.lock();
            diag.entries_dispatched += 1;
            diag.last_dispatch_time = Some(elapsed);
        }
        if elapsed > threshold && self.dispatch_warning.ready() {
            warn!(
                namespace = %entry.namespace,
                elapsed_ms = elapsed.as_millis() as u64,
                subscribers = handlers.len(),
                "change entry dispatch slower than latency threshold"
            );
        }
    }

    /// Replace a partial update with the current full document.
    fn resolve(&self, entry: ChangeEntry) -> Option<ChangeEntry> {
        let reason = match self.store.find_one(&entry.namespace, &entry.document_id) {
            Ok(Some(document)) => {
                self.shared.diagnostics.lock().entries_resolved += 1;
                return Some(entry.resolved(document));
            }
            Ok(None) => {
                // Deleted since; the delete entry that follows reconciles.
                debug!(namespace = %entry.namespace, id = %entry.document_id, "updated document no longer exists");
                "document no longer exists".to_string()
            }
            Err(e) => {
                warn!(namespace = %entry.namespace, id = %entry.document_id, error = %e, "failed to resolve partial update");
                e.to_string()
            }
        };

        self.shared.diagnostics.lock().entries_dropped += 1;
        self.shared.publish(ListenerEvent::EntryDropped {
            namespace: entry.namespace,
            id: entry.document_id,
            reason,
        });
        None
    }

    fn tick(&self) {
        self.shared.diagnostics.lock().ticks += 1;
        let registry = self.shared.registry.read();
        if registry.is_empty() {
            debug!("change feed tick: no active subscriptions");
        }
        for (namespace, subs) in registry.iter() {
            info!(namespace = %namespace, subscriptions = subs.len(), "change feed tick");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn ns() -> Namespace {
        Namespace::new("db", "dollhouse")
    }

    fn fast_config() -> ListenerConfig {
        ListenerConfig::default().with_backoff(BackoffConfig::new(
            Duration::from_millis(10),
            Duration::from_millis(5),
        ))
    }

    fn listener(store: &Arc<MemoryStore>) -> ChangeFeedListener {
        ChangeFeedListener::new(store.clone(), store.clone(), fast_config()).unwrap()
    }

    fn collecting_handler() -> (Arc<dyn OperationHandler>, Receiver<ChangeEntry>) {
        let (tx, rx) = unbounded();
        let handler = move |entry: &ChangeEntry| {
            let _ = tx.send(entry.clone());
        };
        (Arc::new(handler), rx)
    }

    fn wait_for(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Source whose entries are pushed by the test.
    struct ManualSource {
        tx: Mutex<Option<Sender<Result<ChangeEntry>>>>,
    }

    impl ChangeLogSource for ManualSource {
        fn tail(&self) -> Result<ChangeStream> {
            let (tx, rx) = unbounded();
            *self.tx.lock() = Some(tx);
            Ok(rx)
        }
    }

    /// Source whose connection attempts block until the test decides
    /// their outcome.
    struct GatedSource {
        gate: Receiver<bool>,
        open: Mutex<Vec<Sender<Result<ChangeEntry>>>>,
    }

    impl ChangeLogSource for GatedSource {
        fn tail(&self) -> Result<ChangeStream> {
            match self.gate.recv() {
                Ok(true) => {
                    let (tx, rx) = unbounded();
                    self.open.lock().push(tx);
                    Ok(rx)
                }
                _ => Err(LiveError::Connection("gate refused".into())),
            }
        }
    }

    #[test]
    fn test_start_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let listener = listener(&store);
        assert_eq!(listener.state(), ListenerState::Disconnected);

        listener.start().unwrap();
        listener.start().unwrap();
        assert_eq!(listener.state(), ListenerState::Tailing);
        assert_eq!(store.tail_count(), 1);
    }

    #[test]
    fn test_concurrent_start_shares_outcome() {
        let (gate, gate_rx) = unbounded();
        let source = Arc::new(GatedSource {
            gate: gate_rx,
            open: Mutex::new(Vec::new()),
        });
        let store = Arc::new(MemoryStore::new());
        let listener = Arc::new(ChangeFeedListener::new(source, store, fast_config()).unwrap());

        let callers: Vec<_> = (0..4)
            .map(|_| {
                let listener = Arc::clone(&listener);
                thread::spawn(move || listener.start())
            })
            .collect();

        // Every caller is parked on the first attempt, which then fails.
        thread::sleep(Duration::from_millis(200));
        gate.send(false).unwrap();
        for caller in callers {
            assert!(matches!(caller.join().unwrap(), Err(LiveError::Connection(_))));
        }

        // The background retry connects afterwards.
        gate.send(true).unwrap();
        wait_for(|| listener.state() == ListenerState::Tailing);
        listener.start().unwrap();
    }

    #[test]
    fn test_dispatch_by_namespace() {
        let store = Arc::new(MemoryStore::new());
        let listener = listener(&store);
        listener.start().unwrap();

        let (handler, rx) = collecting_handler();
        let _sub = listener.listen(ns(), handler);
        let (other_handler, other_rx) = collecting_handler();
        let _other = listener.listen(Namespace::new("db", "other"), other_handler);

        store.insert(&ns(), json!({"_id": "echo", "age": 10})).unwrap();

        let entry = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(entry.document, Some(json!({"_id": "echo", "age": 10})));
        assert!(other_rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(listener.subscription_count(), 2);
    }

    #[test]
    fn test_partial_update_is_resolved() {
        let store = Arc::new(MemoryStore::new());
        let listener = listener(&store);
        listener.start().unwrap();
        let (handler, rx) = collecting_handler();
        let _sub = listener.listen(ns(), handler);

        store.insert(&ns(), json!({"_id": "echo", "someOldProp": "cool"})).unwrap();
        store
            .update(&ns(), &"echo".into(), &json!({"$set": {"newProp": "yes"}}), false)
            .unwrap();

        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let update = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(update.operation, crate::types::OperationKind::Update);
        assert_eq!(
            update.document,
            Some(json!({"_id": "echo", "someOldProp": "cool", "newProp": "yes"}))
        );
        assert_eq!(listener.diagnostics().entries_resolved, 1);
    }

    #[test]
    fn test_unresolvable_update_is_dropped() {
        let source = Arc::new(ManualSource { tx: Mutex::new(None) });
        let store = Arc::new(MemoryStore::new());
        let listener = ChangeFeedListener::new(source.clone(), store, fast_config()).unwrap();
        let events = listener.events();
        listener.start().unwrap();

        let (handler, rx) = collecting_handler();
        let _sub = listener.listen(ns(), handler);

        let tx = source.tx.lock().clone().unwrap();
        tx.send(Ok(ChangeEntry::partial_update(ns(), "gone".into(), json!({"$set": {"a": 1}}))))
            .unwrap();
        tx.send(Ok(ChangeEntry::delete(ns(), "gone".into()))).unwrap();

        // Only the delete arrives.
        let entry = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(entry.operation, crate::types::OperationKind::Delete);
        assert_eq!(listener.diagnostics().entries_dropped, 1);

        let dropped = events
            .iter()
            .find(|e| matches!(e, ListenerEvent::EntryDropped { .. }))
            .unwrap();
        match dropped {
            ListenerEvent::EntryDropped { id, .. } => assert_eq!(id.as_str(), "gone"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_entries_without_subscribers_are_discarded() {
        let store = Arc::new(MemoryStore::new());
        let listener = listener(&store);
        listener.start().unwrap();

        store.insert(&ns(), json!({"_id": "echo"})).unwrap();
        wait_for(|| listener.diagnostics().entries_received == 1);
        assert_eq!(listener.diagnostics().entries_dispatched, 0);
    }

    #[test]
    fn test_dispose_removes_only_that_subscription() {
        let store = Arc::new(MemoryStore::new());
        let listener = listener(&store);
        listener.start().unwrap();

        let (h1, rx1) = collecting_handler();
        let (h2, rx2) = collecting_handler();
        let sub1 = listener.listen(ns(), h1);
        let _sub2 = listener.listen(ns(), h2);

        sub1.dispose();
        sub1.dispose();
        store.insert(&ns(), json!({"_id": "echo"})).unwrap();

        assert!(rx2.recv_timeout(Duration::from_secs(1)).is_ok());
        assert!(rx1.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(listener.subscription_count(), 1);
        assert_eq!(listener.state(), ListenerState::Tailing);
    }

    #[test]
    fn test_reconnect_keeps_subscriptions() {
        let store = Arc::new(MemoryStore::new());
        let listener = listener(&store);
        let events = listener.events();
        listener.start().unwrap();

        let (handler, rx) = collecting_handler();
        let _sub = listener.listen(ns(), handler);

        store.fail_next_tails(2);
        store.interrupt_feed();
        wait_for(|| listener.diagnostics().reconnects == 1 && listener.state() == ListenerState::Tailing);

        store.insert(&ns(), json!({"_id": "after"})).unwrap();
        let entry = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(entry.document_id.as_str(), "after");

        let seen: Vec<ListenerEvent> = events.try_iter().collect();
        assert!(matches!(seen[0], ListenerEvent::Connected));
        assert!(seen.iter().any(|e| matches!(e, ListenerEvent::Disconnected { .. })));
        assert_eq!(
            seen.iter().filter(|e| matches!(e, ListenerEvent::ConnectFailed { .. })).count(),
            2
        );
        assert!(seen.iter().any(|e| matches!(e, ListenerEvent::Reconnected { subscriptions: 1 })));
    }

    #[test]
    fn test_slow_entries_are_reported() {
        let source = Arc::new(ManualSource { tx: Mutex::new(None) });
        let store = Arc::new(MemoryStore::new());
        let config = fast_config().with_latency_threshold(Duration::from_millis(100));
        let listener = ChangeFeedListener::new(source.clone(), store, config).unwrap();
        let events = listener.events();
        listener.start().unwrap();

        let stale = Timestamp::now().saturating_sub(Duration::from_secs(5));
        let tx = source.tx.lock().clone().unwrap();
        tx.send(Ok(ChangeEntry::insert(ns(), "a".into(), json!({"_id": "a"})).at(stale)))
            .unwrap();

        let event = events.recv_timeout(Duration::from_secs(1)).unwrap();
        let event = if matches!(event, ListenerEvent::Connected) {
            events.recv_timeout(Duration::from_secs(1)).unwrap()
        } else {
            event
        };
        match event {
            ListenerEvent::SlowEntry { lag, .. } => assert!(lag >= Duration::from_secs(5)),
            other => panic!("expected SlowEntry, got {:?}", other),
        }
        assert!(listener.diagnostics().last_receive_lag.unwrap() >= Duration::from_secs(5));
    }

    #[test]
    fn test_slow_dispatch_is_measured() {
        let store = Arc::new(MemoryStore::new());
        let config = fast_config().with_latency_threshold(Duration::from_millis(5));
        let listener = ChangeFeedListener::new(store.clone(), store.clone(), config).unwrap();
        listener.start().unwrap();

        let (tx, rx) = unbounded();
        let slow = move |entry: &ChangeEntry| {
            thread::sleep(Duration::from_millis(30));
            let _ = tx.send(entry.document_id.clone());
        };
        let _sub = listener.listen(ns(), Arc::new(slow));

        store.insert(&ns(), json!({"_id": "sloth"})).unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        wait_for(|| listener.diagnostics().entries_dispatched == 1);

        let dispatch_time = listener.diagnostics().last_dispatch_time.unwrap();
        assert!(dispatch_time > Duration::from_millis(5));
    }

    #[test]
    fn test_tick_runs_while_tailing() {
        let store = Arc::new(MemoryStore::new());
        let config = fast_config().with_tick_interval(Duration::from_millis(10));
        let listener = ChangeFeedListener::new(store.clone(), store.clone(), config).unwrap();
        listener.start().unwrap();

        let (handler, _rx) = collecting_handler();
        let _sub = listener.listen(ns(), handler);
        wait_for(|| listener.diagnostics().ticks >= 2);
        assert_eq!(listener.subscriptions_by_namespace().get(&ns()), Some(&1));
    }

    #[test]
    fn test_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let listener = listener(&store);
        listener.start().unwrap();
        listener.shutdown();
        listener.shutdown();

        assert_eq!(listener.state(), ListenerState::Disconnected);
        assert!(matches!(listener.start(), Err(LiveError::ListenerShutdown)));
    }
}
