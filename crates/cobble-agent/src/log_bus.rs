use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use cobble_process::{EventBody, LogEvent, ServerId, ServerState, Severity};
use tokio::{
    sync::{Mutex, Notify},
    task::JoinHandle,
};

use crate::config::BusConfig;

/// Prefix for notices the agent itself writes into a server's console.
pub const NOTICE_PREFIX: &str = "[cobble]";

#[async_trait]
pub trait LogObserver: Send + Sync {
    /// Receives one batch, already filtered for this observer.
    async fn deliver(&self, batch: &[LogEvent]) -> anyhow::Result<()>;

    fn name(&self) -> &str {
        "observer"
    }
}

#[derive(Debug, Clone, Default)]
pub struct ObserverFilter {
    pub server_id: Option<ServerId>,
    pub min_severity: Option<Severity>,
}

impl ObserverFilter {
    pub fn matches(&self, ev: &LogEvent) -> bool {
        if let Some(want) = &self.server_id
            && ev.server_id.as_ref() != Some(want)
        {
            return false;
        }
        // State changes always pass the severity gate.
        if matches!(ev.body, EventBody::StatusChange { .. }) {
            return true;
        }
        self.min_severity.is_none_or(|min| ev.severity >= min)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Replay {
    #[default]
    None,
    Global,
    Server(ServerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    Dropped,
    Evicted,
}

#[derive(Debug)]
pub struct BoundedQueue {
    items: VecDeque<LogEvent>,
    capacity: usize,
}

impl BoundedQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, ev: LogEvent) -> PushOutcome {
        if self.items.len() < self.capacity {
            self.items.push_back(ev);
            return PushOutcome::Queued;
        }
        if ev.is_droppable() {
            return PushOutcome::Dropped;
        }
        self.items.pop_front();
        self.items.push_back(ev);
        PushOutcome::Evicted
    }

    fn drain_up_to(&mut self, max: usize, out: &mut Vec<LogEvent>) {
        let n = max.min(self.items.len());
        out.extend(self.items.drain(..n));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub queued: usize,
    pub dropped: u64,
    pub evicted: u64,
    pub delivered_batches: u64,
}

struct ObserverEntry {
    id: ObserverId,
    filter: ObserverFilter,
    observer: Arc<dyn LogObserver>,
}

#[derive(Default)]
struct Registry {
    observers: Vec<ObserverEntry>,
    global: VecDeque<LogEvent>,
    per_server: HashMap<ServerId, VecDeque<LogEvent>>,
}

impl Registry {
    fn record(&mut self, batch: &[LogEvent], cfg: &BusConfig) {
        for ev in batch {
            if matches!(ev.body, EventBody::Progress { .. }) {
                continue;
            }
            push_capped(&mut self.global, ev.clone(), cfg.history_global);
            if let Some(id) = &ev.server_id {
                let hist = self.per_server.entry(id.clone()).or_default();
                push_capped(hist, ev.clone(), cfg.history_per_server);
            }
        }
    }
}

fn push_capped(buf: &mut VecDeque<LogEvent>, ev: LogEvent, cap: usize) {
    while buf.len() >= cap.max(1) {
        buf.pop_front();
    }
    buf.push_back(ev);
}

struct BusShared {
    config: BusConfig,
    queue: std::sync::Mutex<BoundedQueue>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
    evicted: AtomicU64,
    delivered_batches: AtomicU64,
    next_id: AtomicU64,
    registry: Mutex<Registry>,
}

/// Producer/registration handle. Cheap to clone.
#[derive(Clone)]
pub struct LogBus {
    shared: Arc<BusShared>,
}

impl LogBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            shared: Arc::new(BusShared {
                config,
                queue: std::sync::Mutex::new(BoundedQueue::new(config.capacity)),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
                evicted: AtomicU64::new(0),
                delivered_batches: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Starts the single consumer task.
    pub fn spawn(&self) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move { bus.run().await })
    }

    /// Enqueues without waiting.
    pub fn publish(&self, ev: LogEvent) -> PushOutcome {
        if self.shared.closed.load(Ordering::Acquire) {
            return PushOutcome::Dropped;
        }
        let outcome = {
            let mut q = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            q.push(ev)
        };
        match outcome {
            PushOutcome::Queued => {}
            PushOutcome::Dropped => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                return outcome;
            }
            PushOutcome::Evicted => {
                self.shared.evicted.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.shared.notify.notify_one();
        outcome
    }

    /// Stops accepting events; the consumer drains what is queued and exits.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }

    pub fn stats(&self) -> BusStats {
        let queued = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len();
        BusStats {
            queued,
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            evicted: self.shared.evicted.load(Ordering::Relaxed),
            delivered_batches: self.shared.delivered_batches.load(Ordering::Relaxed),
        }
    }

    pub fn for_server(&self, server_id: ServerId) -> ServerLog {
        ServerLog {
            bus: self.clone(),
            server_id,
        }
    }

    /// Adds an observer, first replaying matching history to it.
    ///
    /// Replay happens under the same lock the consumer delivers under, so the
    /// observer sees history followed by live events with no gap or overlap.
    pub async fn register(
        &self,
        observer: Arc<dyn LogObserver>,
        filter: ObserverFilter,
        replay: Replay,
    ) -> anyhow::Result<ObserverId> {
        let mut reg = self.shared.registry.lock().await;

        let history: Vec<LogEvent> = match &replay {
            Replay::None => Vec::new(),
            Replay::Global => reg.global.iter().filter(|e| filter.matches(e)).cloned().collect(),
            Replay::Server(id) => reg
                .per_server
                .get(id)
                .map(|h| h.iter().filter(|e| filter.matches(e)).cloned().collect())
                .unwrap_or_default(),
        };
        if !history.is_empty() {
            deliver_one(observer.as_ref(), &history, self.shared.config.delivery_timeout)
                .await
                .map_err(|e| anyhow::anyhow!("replay to {} failed: {e}", observer.name()))?;
        }

        let id = ObserverId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        reg.observers.push(ObserverEntry {
            id,
            filter,
            observer,
        });
        Ok(id)
    }

    pub async fn unregister(&self, id: ObserverId) -> bool {
        let mut reg = self.shared.registry.lock().await;
        let before = reg.observers.len();
        reg.observers.retain(|o| o.id != id);
        reg.observers.len() != before
    }

    pub async fn observer_count(&self) -> usize {
        self.shared.registry.lock().await.observers.len()
    }

    pub async fn history(&self, server_id: Option<&ServerId>) -> Vec<LogEvent> {
        let reg = self.shared.registry.lock().await;
        match server_id {
            None => reg.global.iter().cloned().collect(),
            Some(id) => reg
                .per_server
                .get(id)
                .map(|h| h.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }

    /// Consumer loop. Returns once closed and drained.
    pub async fn run(self) {
        let cfg = self.shared.config;
        let mut batch = Vec::with_capacity(cfg.batch_max);
        loop {
            if !self.wait_for_items().await {
                break;
            }

            let deadline = tokio::time::Instant::now() + cfg.batch_window;
            loop {
                {
                    let mut q = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
                    q.drain_up_to(cfg.batch_max - batch.len(), &mut batch);
                }
                if batch.len() >= cfg.batch_max || self.shared.closed.load(Ordering::Acquire) {
                    break;
                }
                if tokio::time::timeout_at(deadline, self.shared.notify.notified())
                    .await
                    .is_err()
                {
                    break;
                }
            }

            if !batch.is_empty() {
                self.dispatch(&batch).await;
                batch.clear();
            }
        }
        tracing::debug!("log bus consumer stopped");
    }

    /// Waits until something is queued. Returns false once closed and empty.
    async fn wait_for_items(&self) -> bool {
        loop {
            let empty = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_empty();
            if !empty {
                return true;
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return false;
            }
            self.shared.notify.notified().await;
        }
    }

    async fn dispatch(&self, batch: &[LogEvent]) {
        let cfg = self.shared.config;
        let mut reg = self.shared.registry.lock().await;
        reg.record(batch, &cfg);

        let mut failed = Vec::new();
        for entry in &reg.observers {
            let filtered: Vec<LogEvent> = batch
                .iter()
                .filter(|e| entry.filter.matches(e))
                .cloned()
                .collect();
            if filtered.is_empty() {
                continue;
            }
            if let Err(err) =
                deliver_one(entry.observer.as_ref(), &filtered, cfg.delivery_timeout).await
            {
                tracing::warn!(observer = entry.observer.name(), error = %err, "dropping log observer");
                failed.push(entry.id);
            }
        }
        if !failed.is_empty() {
            reg.observers.retain(|o| !failed.contains(&o.id));
        }
        self.shared
            .delivered_batches
            .fetch_add(1, Ordering::Relaxed);
    }
}

async fn deliver_one(
    observer: &dyn LogObserver,
    batch: &[LogEvent],
    timeout: Duration,
) -> anyhow::Result<()> {
    match tokio::time::timeout(timeout, observer.deliver(batch)).await {
        Ok(res) => res,
        Err(_) => anyhow::bail!("delivery timed out after {}ms", timeout.as_millis()),
    }
}

/// Adapts a `(message, severity, server id)` callback into an observer.
pub struct CallbackObserver<F> {
    name: String,
    callback: F,
}

impl<F> CallbackObserver<F>
where
    F: Fn(&str, Severity, Option<&ServerId>) + Send + Sync,
{
    pub fn new(name: impl Into<String>, callback: F) -> Self {
        Self {
            name: name.into(),
            callback,
        }
    }
}

#[async_trait]
impl<F> LogObserver for CallbackObserver<F>
where
    F: Fn(&str, Severity, Option<&ServerId>) + Send + Sync,
{
    async fn deliver(&self, batch: &[LogEvent]) -> anyhow::Result<()> {
        for ev in batch {
            (self.callback)(&ev.message(), ev.severity, ev.server_id.as_ref());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Publishing handle bound to one server.
#[derive(Clone)]
pub struct ServerLog {
    bus: LogBus,
    server_id: ServerId,
}

impl ServerLog {
    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Console output relayed from the server process.
    pub fn line(&self, severity: Severity, text: impl Into<String>) {
        self.bus
            .publish(LogEvent::line(Some(self.server_id.clone()), severity, text));
    }

    /// A notice written by the agent itself.
    pub fn notice(&self, severity: Severity, text: impl AsRef<str>) {
        self.line(severity, format!("{NOTICE_PREFIX} {}", text.as_ref()));
    }

    pub fn status(&self, state: ServerState) {
        self.bus
            .publish(LogEvent::status_change(Some(self.server_id.clone()), state));
    }

    pub fn progress(&self, task: &str, percent: u8, error: Option<String>) {
        self.bus.publish(LogEvent::progress(
            Some(self.server_id.clone()),
            task,
            percent,
            error,
        ));
    }
}
