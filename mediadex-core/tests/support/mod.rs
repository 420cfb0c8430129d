#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use mediadex_core::autoscan::{Timer, TimerParameter, TimerSubscriber};
use mediadex_core::config::IndexerConfig;
use mediadex_core::content::{
    ContentManager, ContentServices, ContentStorage, InMemoryFs, InMemoryStorage,
};
use mediadex_core::scheduler::{Task, TaskContext, TaskKind, TaskScheduler};
use mediadex_core::{IndexError, Result};

pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
}

pub async fn wait_idle(scheduler: &TaskScheduler) {
    tokio::time::timeout(IDLE_TIMEOUT, scheduler.wait_for_idle())
        .await
        .expect("scheduler did not become idle");
}

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

/// Appends its label to a shared log when run.
pub struct Record {
    pub label: String,
    pub log: Log,
}

impl Record {
    pub fn new(label: impl Into<String>, log: &Log) -> Self {
        Self {
            label: label.into(),
            log: Arc::clone(log),
        }
    }
}

#[async_trait]
impl Task for Record {
    fn kind(&self) -> TaskKind {
        TaskKind::Other
    }

    fn description(&self) -> String {
        format!("record {}", self.label)
    }

    async fn run(&self, _ctx: &TaskContext) -> Result<()> {
        self.log.lock().push(self.label.clone());
        Ok(())
    }
}

/// Keeps the worker busy until released.
pub struct Gate {
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[derive(Clone)]
pub struct GateHandle {
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl GateHandle {
    pub async fn wait_started(&self) {
        tokio::time::timeout(IDLE_TIMEOUT, self.started.notified())
            .await
            .expect("gate task never started");
    }

    pub fn open(&self) {
        self.release.notify_one();
    }
}

pub fn gate() -> (Gate, GateHandle) {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    (
        Gate {
            started: Arc::clone(&started),
            release: Arc::clone(&release),
        },
        GateHandle { started, release },
    )
}

#[async_trait]
impl Task for Gate {
    fn kind(&self) -> TaskKind {
        TaskKind::Other
    }

    fn description(&self) -> String {
        "gate".to_string()
    }

    async fn run(&self, _ctx: &TaskContext) -> Result<()> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

pub struct Failing;

#[async_trait]
impl Task for Failing {
    fn kind(&self) -> TaskKind {
        TaskKind::Other
    }

    fn description(&self) -> String {
        "failing".to_string()
    }

    async fn run(&self, _ctx: &TaskContext) -> Result<()> {
        Err(IndexError::Storage("disk on fire".into()))
    }
}

pub struct Panicking;

#[async_trait]
impl Task for Panicking {
    fn kind(&self) -> TaskKind {
        TaskKind::Other
    }

    fn description(&self) -> String {
        "panicking".to_string()
    }

    async fn run(&self, _ctx: &TaskContext) -> Result<()> {
        panic!("task body exploded");
    }
}

/// Runs until invalidated, then reports the cancellation.
pub struct UntilInvalidated {
    pub started: Arc<Notify>,
    pub log: Log,
}

#[async_trait]
impl Task for UntilInvalidated {
    fn kind(&self) -> TaskKind {
        TaskKind::Other
    }

    fn description(&self) -> String {
        "until invalidated".to_string()
    }

    async fn run(&self, ctx: &TaskContext) -> Result<()> {
        self.started.notify_one();
        ctx.invalidated().await;
        self.log.lock().push("observed invalidation".to_string());
        ctx.checkpoint()
    }
}

struct Subscription {
    subscriber: Weak<dyn TimerSubscriber>,
    interval: Duration,
}

/// [`Timer`] that only fires when told to.
#[derive(Default)]
pub struct ManualTimer {
    subscriptions: Mutex<HashMap<TimerParameter, Subscription>>,
}

impl ManualTimer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_subscribed(&self, parameter: &TimerParameter) -> bool {
        self.subscriptions.lock().contains_key(parameter)
    }

    pub fn interval(&self, parameter: &TimerParameter) -> Option<Duration> {
        self.subscriptions
            .lock()
            .get(parameter)
            .map(|subscription| subscription.interval)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn fire(&self, parameter: TimerParameter) {
        let subscriber = self
            .subscriptions
            .lock()
            .get(&parameter)
            .and_then(|subscription| subscription.subscriber.upgrade());
        if let Some(subscriber) = subscriber {
            subscriber.timer_notify(parameter);
        }
    }
}

impl Timer for ManualTimer {
    fn add_subscriber(
        &self,
        subscriber: Weak<dyn TimerSubscriber>,
        interval: Duration,
        parameter: TimerParameter,
    ) {
        self.subscriptions.lock().insert(
            parameter,
            Subscription {
                subscriber,
                interval,
            },
        );
    }

    fn remove_subscriber(&self, parameter: TimerParameter) {
        self.subscriptions.lock().remove(&parameter);
    }
}

pub struct Harness {
    pub fs: Arc<InMemoryFs>,
    pub storage: Arc<InMemoryStorage>,
    pub timer: Arc<ManualTimer>,
    pub scheduler: Arc<TaskScheduler>,
    pub manager: Arc<ContentManager>,
}

impl Harness {
    /// Must be called from within a tokio runtime.
    pub fn new(config: IndexerConfig) -> Self {
        Self::with_parts(config, Arc::new(InMemoryFs::new()), Arc::new(InMemoryStorage::new()))
    }

    pub fn with_parts(
        config: IndexerConfig,
        fs: Arc<InMemoryFs>,
        storage: Arc<InMemoryStorage>,
    ) -> Self {
        let timer = ManualTimer::new();
        let scheduler = TaskScheduler::new("test");
        scheduler.start().expect("scheduler starts");
        let manager = ContentManager::new(
            &config,
            ContentServices {
                storage: storage.clone(),
                fs: fs.clone(),
                scheduler: scheduler.clone(),
                timer: timer.clone(),
            },
        )
        .expect("valid configuration");
        Self {
            fs,
            storage,
            timer,
            scheduler,
            manager,
        }
    }

    pub async fn idle(&self) {
        wait_idle(&self.scheduler).await;
    }

    pub async fn object_at(&self, path: &str) -> Option<mediadex_core::ObjectId> {
        self.storage
            .find_object_id_by_path(Path::new(path))
            .await
            .expect("storage available")
    }
}
