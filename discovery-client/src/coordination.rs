//! Session ownership and the tick-driven work loop.
//!
//! A `CoordinationLoop` owns exactly one coordination store session. Every
//! tick it reconnects if needed, asks its task for the current generation and
//! only runs the task's work when the generation moved past the last fully
//! processed one. Transient store failures never end the loop; the work is
//! simply retried on a later tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use crate::error::StoreError;
use crate::store::{
    CoordinationStore, EventKind, EventReceiver, KeeperState, Session, StoreResult, WatchedEvent,
};

/// One run of the work loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pass {
    pub tick: u64,
    pub generation: u64,
}

/// Work driven by a `CoordinationLoop`.
#[async_trait]
pub trait ProcessingTask: Send + 'static {
    /// Generation the loop should have processed after this tick. Implementations
    /// bump `generation` to request a run.
    fn determine_current_generation(&mut self, generation: &AtomicU64, _tick: u64) -> u64 {
        generation.load(Ordering::SeqCst)
    }

    /// Returns true when the pass is complete. False or an error leave the
    /// generation unprocessed so the pass runs again.
    async fn do_work(&mut self, session: &dyn Session, pass: Pass) -> StoreResult<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Session opened, but the store has not confirmed the connection yet.
    /// Work is attempted and its first success confirms it.
    Connecting,
    Connected,
}

/// Handle to a spawned loop
pub struct LoopHandle {
    name: &'static str,
    cancel: CancellationToken,
    generation: Arc<AtomicU64>,
    join: JoinHandle<()>,
}

impl LoopHandle {
    /// Requests a run on the next tick.
    pub fn trigger(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Stops the loop and waits until its session is closed.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            warn!("{} loop ended abnormally: {}", self.name, e);
        }
    }
}

pub struct CoordinationLoop<T> {
    name: &'static str,
    store: Arc<dyn CoordinationStore>,
    task: T,
    tick_interval: Duration,
    session_timeout: Duration,
    /// Starts at 1 so the first connected tick runs the task
    generation: Arc<AtomicU64>,
    /// Shared by work dispatch and session teardown
    session: Arc<Mutex<Option<Arc<dyn Session>>>>,
    events: Option<EventReceiver>,
    state: ConnectionState,
}

impl<T: ProcessingTask> CoordinationLoop<T> {
    pub fn new(
        name: &'static str,
        store: Arc<dyn CoordinationStore>,
        task: T,
        tick_interval: Duration,
        session_timeout: Duration,
    ) -> Self {
        Self {
            name,
            store,
            task,
            tick_interval,
            session_timeout,
            generation: Arc::new(AtomicU64::new(1)),
            session: Arc::new(Mutex::new(None)),
            events: None,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn generation(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.generation)
    }

    pub fn spawn(self) -> LoopHandle {
        let name = self.name;
        let cancel = CancellationToken::new();
        let generation = self.generation();
        let loop_cancel = cancel.clone();
        let join = tokio::spawn(async move { self.run(loop_cancel).await });

        info!("Started {} loop", name);
        LoopHandle {
            name,
            cancel,
            generation,
            join,
        }
    }

    /// Runs until `cancel` fires, then closes the session.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_generation = 0u64;
        let mut ticker = 0u64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("{} loop cancelled, exiting", self.name);
                    break;
                }
                _ = interval.tick() => {}
            }

            let tick = ticker;
            ticker += 1;
            trace!("Tick {}", tick);

            self.drain_events().await;
            if self.state != ConnectionState::Connected {
                self.open_session().await;
                self.drain_events().await;
            }
            if self.state == ConnectionState::Disconnected {
                continue;
            }

            let current = self.task.determine_current_generation(&self.generation, tick);
            if last_generation >= current {
                continue;
            }

            debug!("{}: processing generation {} (tick {})", self.name, current, tick);
            match self.process(Pass { tick, generation: current }).await {
                Ok(done) => {
                    if self.state == ConnectionState::Connecting {
                        debug!("{}: store answered, session is connected", self.name);
                        self.state = ConnectionState::Connected;
                    }
                    if done {
                        last_generation = current;
                    }
                }
                Err(e) => self.process_store_error(e).await,
            }
        }

        self.close_session().await;
    }

    async fn process(&mut self, pass: Pass) -> StoreResult<bool> {
        let guard = self.session.lock().await;
        // The session may have been torn down after the connection check
        let Some(session) = guard.as_ref().map(Arc::clone) else {
            return Ok(false);
        };
        self.task.do_work(session.as_ref(), pass).await
    }

    async fn open_session(&mut self) {
        let mut guard = self.session.lock().await;
        if guard.is_some() {
            // The store reconnects an existing session on its own
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        match self.store.connect(self.session_timeout, tx).await {
            Ok(session) => {
                debug!("{}: opened session {}", self.name, session.id());
                *guard = Some(session);
                self.events = Some(rx);
                self.state = ConnectionState::Connecting;
                // Nothing the previous session did survives it
                self.generation.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                warn!("{}: could not connect to coordination store, retrying: {}", self.name, e);
            }
        }
    }

    async fn close_session(&mut self) {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.take() {
            if let Err(e) = session.close().await {
                debug!("{}: error closing session {}: {}", self.name, session.id(), e);
            }
            debug!("{}: closed session {}", self.name, session.id());
        }
        self.events = None;
        self.state = ConnectionState::Disconnected;
    }

    async fn drain_events(&mut self) {
        loop {
            let Some(event) = self.events.as_mut().and_then(|rx| rx.try_recv().ok()) else {
                break;
            };
            self.process_event(event).await;
        }
    }

    async fn process_event(&mut self, event: WatchedEvent) {
        trace!("{}: received {:?} event", self.name, event.state);
        match event.state {
            KeeperState::AuthFailed => {
                warn!(
                    "{}: authentication failed, the store configuration is not compatible with this client",
                    self.name
                );
            }
            KeeperState::SyncConnected => {
                self.state = ConnectionState::Connected;
                if event.kind != EventKind::None {
                    trace!("{}: store state changed: {:?}", self.name, event.kind);
                    self.generation.fetch_add(1, Ordering::SeqCst);
                }
            }
            KeeperState::Disconnected => {
                trace!("{}: session disconnected, waiting for reconnect", self.name);
                self.state = ConnectionState::Disconnected;
            }
            KeeperState::Expired => {
                trace!("{}: session expired, closing it", self.name);
                self.close_session().await;
            }
        }
    }

    async fn process_store_error(&mut self, error: StoreError) {
        if error.is_connection_loss() {
            trace!("{}: connection lost, waiting for reconnect", self.name);
            self.state = ConnectionState::Disconnected;
        } else if error.is_session_expired() {
            trace!("{}: session expired, closing it", self.name);
            self.close_session().await;
        } else {
            warn!("{}: coordination store problem: {}", self.name, error);
        }
    }
}

/// Visitor of the children of the discovery root.
#[async_trait]
pub trait Visitor: Send {
    /// Lets the visitor request a pass by bumping `generation`.
    fn determine_generation(&mut self, _generation: &AtomicU64, _tick: u64) {}

    async fn visit(
        &mut self,
        children: &[String],
        session: &dyn Session,
        generation: u64,
    ) -> StoreResult<()>;
}

/// Lists the discovery root and hands the children to every visitor.
///
/// A full pass happens at least every `scan_ticks` ticks, even when neither a
/// visitor nor a watch asked for one.
pub struct DiscoveryTask {
    root: String,
    scan_ticks: u64,
    last_scan: u64,
    visitors: Vec<Box<dyn Visitor>>,
}

impl DiscoveryTask {
    pub fn new(root: impl Into<String>, scan_ticks: u64, visitors: Vec<Box<dyn Visitor>>) -> Self {
        let scan_ticks = scan_ticks.max(1);
        info!("Scan ticks is {}", scan_ticks);
        Self {
            root: root.into(),
            scan_ticks,
            last_scan: 0,
            visitors,
        }
    }
}

#[async_trait]
impl ProcessingTask for DiscoveryTask {
    fn determine_current_generation(&mut self, generation: &AtomicU64, tick: u64) -> u64 {
        if tick - self.last_scan >= self.scan_ticks {
            self.last_scan = tick;
            return generation.fetch_add(1, Ordering::SeqCst) + 1;
        }

        for visitor in &mut self.visitors {
            visitor.determine_generation(generation, tick);
        }
        generation.load(Ordering::SeqCst)
    }

    async fn do_work(&mut self, session: &dyn Session, pass: Pass) -> StoreResult<bool> {
        debug!("Scanning {} (tick is {})", self.root, pass.tick);
        // Arms the watch for the next change before anything is visited
        let children = session.get_children(&self.root, true).await?;

        for visitor in &mut self.visitors {
            visitor.visit(&children, session, pass.generation).await?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use crate::error::StoreErrorCode;
    use crate::store::memory::StoreOp;
    use crate::store::{EventSender, MemoryStore};

    const ROOT: &str = "/ness/srvc";

    #[derive(Clone, Default)]
    struct Recorder {
        visits: Arc<StdMutex<Vec<(Vec<String>, u64, u64)>>>,
        fail_next: Arc<StdMutex<Option<StoreError>>>,
    }

    impl Recorder {
        fn visits(&self) -> Vec<(Vec<String>, u64, u64)> {
            self.visits.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Visitor for Recorder {
        async fn visit(
            &mut self,
            children: &[String],
            session: &dyn Session,
            generation: u64,
        ) -> StoreResult<()> {
            if let Some(error) = self.fail_next.lock().unwrap().take() {
                return Err(error);
            }
            let mut children = children.to_vec();
            children.sort();
            self.visits
                .lock()
                .unwrap()
                .push((children, session.id(), generation));
            Ok(())
        }
    }

    /// Passes node events through but swallows every session state event
    struct NodeEventsOnly(MemoryStore);

    #[async_trait]
    impl CoordinationStore for NodeEventsOnly {
        async fn connect(
            &self,
            session_timeout: Duration,
            events: EventSender,
        ) -> StoreResult<Arc<dyn Session>> {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let session = self.0.connect(session_timeout, tx).await?;
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if event.kind != EventKind::None {
                        let _ = events.send(event);
                    }
                }
            });
            Ok(session)
        }
    }

    fn spawn_loop(store: &MemoryStore, recorder: &Recorder, scan_ticks: u64) -> LoopHandle {
        spawn_loop_on(Arc::new(store.clone()), recorder, scan_ticks)
    }

    fn spawn_loop_on(
        store: Arc<dyn CoordinationStore>,
        recorder: &Recorder,
        scan_ticks: u64,
    ) -> LoopHandle {
        let task = DiscoveryTask::new(ROOT, scan_ticks, vec![Box::new(recorder.clone())]);
        CoordinationLoop::new(
            "test",
            store,
            task,
            Duration::from_millis(100),
            Duration::from_secs(3),
        )
        .spawn()
    }

    async fn ticks(count: u64) {
        tokio::time::sleep(Duration::from_millis(100 * count + 50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_visits_once_without_changes() {
        let store = MemoryStore::new();
        store.put(ROOT, Vec::new());
        let recorder = Recorder::default();

        let handle = spawn_loop(&store, &recorder, 1000);
        ticks(10).await;

        assert_eq!(recorder.visits().len(), 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_works_without_session_state_events() {
        let store = MemoryStore::new();
        store.put(ROOT, Vec::new());
        let recorder = Recorder::default();

        let handle = spawn_loop_on(Arc::new(NodeEventsOnly(store.clone())), &recorder, 1000);
        ticks(2).await;
        assert_eq!(store.counters().get_children, 1);
        assert_eq!(recorder.visits().len(), 1);

        // The armed watch still drives the next pass
        store.put(&format!("{}/a", ROOT), Vec::new());
        ticks(2).await;

        let visits = recorder.visits();
        assert_eq!(visits.len(), 2);
        assert_eq!(visits[1].0, vec!["a".to_string()]);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_triggers_pass() {
        let store = MemoryStore::new();
        store.put(ROOT, Vec::new());
        let recorder = Recorder::default();

        let handle = spawn_loop(&store, &recorder, 1000);
        ticks(2).await;
        store.put(&format!("{}/a", ROOT), Vec::new());
        ticks(2).await;

        let visits = recorder.visits();
        assert_eq!(visits.len(), 2);
        assert!(visits[0].0.is_empty());
        assert_eq!(visits[1].0, vec!["a".to_string()]);
        assert!(visits[1].2 > visits[0].2);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_interval_forces_pass() {
        let store = MemoryStore::new();
        store.put(ROOT, Vec::new());
        let recorder = Recorder::default();

        let handle = spawn_loop(&store, &recorder, 5);
        ticks(11).await;

        // tick 0, 5 and 10
        assert_eq!(recorder.visits().len(), 3);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pass_is_retried() {
        let store = MemoryStore::new();
        store.put(ROOT, Vec::new());
        let recorder = Recorder::default();
        *recorder.fail_next.lock().unwrap() =
            Some(StoreError::new(StoreErrorCode::Other("BadArguments".into()), ROOT));

        let handle = spawn_loop(&store, &recorder, 1000);
        ticks(3).await;

        assert_eq!(recorder.visits().len(), 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_loss_recovers_on_same_session() {
        let store = MemoryStore::new();
        store.put(ROOT, Vec::new());
        store.fail_next(StoreOp::GetChildren, StoreErrorCode::ConnectionLoss);
        let recorder = Recorder::default();

        let handle = spawn_loop(&store, &recorder, 1000);
        ticks(3).await;

        // Still disconnected: the store never reported a reconnect
        assert!(recorder.visits().is_empty());

        let session = store.sessions()[0];
        store.reconnect_session(session);
        ticks(2).await;

        let visits = recorder.visits();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].1, session);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_is_recreated() {
        let store = MemoryStore::new();
        store.put(ROOT, Vec::new());
        let recorder = Recorder::default();

        let handle = spawn_loop(&store, &recorder, 1000);
        ticks(2).await;
        let first = store.sessions()[0];

        store.expire_session(first);
        ticks(3).await;

        let sessions = store.sessions();
        assert_eq!(sessions.len(), 1);
        assert_ne!(sessions[0], first);

        // The new session gets a pass of its own
        let visits = recorder.visits();
        assert_eq!(visits.len(), 2);
        assert_eq!(visits[1].1, sessions[0]);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_is_retried() {
        let store = MemoryStore::new();
        store.put(ROOT, Vec::new());
        store.fail_next(StoreOp::Connect, StoreErrorCode::ConnectionLoss);
        let recorder = Recorder::default();

        let handle = spawn_loop(&store, &recorder, 1000);
        ticks(3).await;

        assert_eq!(store.counters().connects, 2);
        assert_eq!(recorder.visits().len(), 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_session() {
        let store = MemoryStore::new();
        store.put(ROOT, Vec::new());
        let recorder = Recorder::default();

        let handle = spawn_loop(&store, &recorder, 1000);
        ticks(2).await;
        assert_eq!(store.sessions().len(), 1);

        handle.shutdown().await;
        assert!(store.sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_requests_pass() {
        let store = MemoryStore::new();
        store.put(ROOT, Vec::new());
        let recorder = Recorder::default();

        let handle = spawn_loop(&store, &recorder, 1000);
        ticks(2).await;
        handle.trigger();
        ticks(2).await;

        assert_eq!(recorder.visits().len(), 2);
        handle.shutdown().await;
    }
}
