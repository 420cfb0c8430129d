use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::task::{
    Task, TaskContext, TaskInfo, TaskMeta, TaskOptions, TaskOwner, TaskPriority,
};
use crate::error::Result;
use crate::lifecycle::{ActivationState, ManagedService};
use crate::types::ids::TaskId;

struct QueuedTask {
    meta: Arc<TaskMeta>,
    body: Box<dyn Task>,
}

struct QueueState {
    next_id: u32,
    normal: VecDeque<QueuedTask>,
    low: VecDeque<QueuedTask>,
    current: Option<Arc<TaskMeta>>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            next_id: 1,
            normal: VecDeque::new(),
            low: VecDeque::new(),
            current: None,
        }
    }

    fn queued(&self) -> impl Iterator<Item = &QueuedTask> {
        self.normal.iter().chain(self.low.iter())
    }

    /// Every task the scheduler still knows about, the running one first.
    fn metas(&self) -> impl Iterator<Item = &Arc<TaskMeta>> {
        self.current
            .iter()
            .chain(self.queued().map(|task| &task.meta))
    }

    /// Strict priority: the low lane is only consulted once the normal lane
    /// is empty. Invalidated entries are dropped here without running.
    fn pop_next(&mut self) -> Option<QueuedTask> {
        loop {
            let task = match self.normal.pop_front() {
                Some(task) => task,
                None => self.low.pop_front()?,
            };
            if task.meta.is_valid() {
                return Some(task);
            }
            debug!(
                task_id = %task.meta.id,
                kind = %task.meta.kind,
                "skipping invalidated task"
            );
        }
    }

    fn is_idle(&self) -> bool {
        self.current.is_none() && self.queued().all(|task| !task.meta.is_valid())
    }
}

struct Shared {
    state: Mutex<QueueState>,
    wakeup: Notify,
    idle: Notify,
}

struct WorkerRuntime {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Two-lane task queue drained by a single background worker.
///
/// Callers on any thread may enqueue, list and invalidate concurrently with
/// the worker. Within a lane tasks run in FIFO order and the normal lane is
/// always drained before the low priority lane; low priority work may starve
/// while normal work keeps arriving.
pub struct TaskScheduler {
    name: &'static str,
    shared: Arc<Shared>,
    worker: Mutex<Option<WorkerRuntime>>,
    activation: ActivationState,
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("TaskScheduler");
        debug.field("name", &self.name);
        match self.shared.state.try_lock() {
            Some(state) => {
                debug
                    .field("normal", &state.normal.len())
                    .field("low", &state.low.len())
                    .field("current", &state.current.as_ref().map(|meta| meta.id));
            }
            None => {
                debug.field("state", &"<locked>");
            }
        }
        match self.worker.try_lock() {
            Some(worker) => {
                debug.field(
                    "worker_running",
                    &worker
                        .as_ref()
                        .is_some_and(|runtime| !runtime.handle.is_finished()),
                );
            }
            None => {
                debug.field("worker", &"<locked>");
            }
        }
        debug
            .field("active", &self.activation.is_active())
            .finish()
    }
}

impl TaskScheduler {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::new()),
                wakeup: Notify::new(),
                idle: Notify::new(),
            }),
            worker: Mutex::new(None),
            activation: ActivationState::new(name),
        })
    }

    /// Spawn the background worker. Tasks enqueued before this call stay
    /// queued until the worker starts. Calling it on a running scheduler is a
    /// no-op.
    pub fn start(&self) -> Result<()> {
        self.activation.ensure_active()?;
        let mut worker = self.worker.lock();
        if worker
            .as_ref()
            .is_some_and(|runtime| !runtime.handle.is_finished())
        {
            return Ok(());
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_worker(
            self.name,
            Arc::clone(&self.shared),
            shutdown.clone(),
        ));
        *worker = Some(WorkerRuntime { shutdown, handle });
        info!(scheduler = self.name, "task scheduler started");
        Ok(())
    }

    /// Ask the worker to exit once its current task returns, and wait for it.
    /// Queued tasks stay queued for a later [`TaskScheduler::start`].
    pub async fn stop(&self) {
        let runtime = self.worker.lock().take();
        let Some(runtime) = runtime else {
            return;
        };

        runtime.shutdown.cancel();
        if let Err(err) = runtime.handle.await {
            error!(scheduler = self.name, error = %err, "task worker terminated abnormally");
        }
        info!(scheduler = self.name, "task scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|runtime| !runtime.handle.is_finished())
    }

    /// Append a task to the lane for `priority` and wake the worker.
    pub fn enqueue<T: Task>(&self, task: T, priority: TaskPriority) -> Result<TaskId> {
        self.enqueue_with(
            Box::new(task),
            TaskOptions::default().with_priority(priority),
        )
    }

    pub fn enqueue_with(&self, task: Box<dyn Task>, options: TaskOptions) -> Result<TaskId> {
        self.activation.ensure_active()?;

        let id = {
            let mut state = self.shared.state.lock();
            let id = TaskId(state.next_id);
            state.next_id = state.next_id.wrapping_add(1).max(1);

            // Sub-tasks of the running task follow its invalidation.
            let token = match (&state.current, options.parent) {
                (Some(current), Some(parent))
                    if current.id == parent && options.cancellable =>
                {
                    current.token.child_token()
                }
                _ => CancellationToken::new(),
            };

            let meta = Arc::new(TaskMeta {
                id,
                kind: task.kind(),
                description: task.description(),
                subject: task.subject().map(|path| path.to_path_buf()),
                options,
                token,
            });
            debug!(
                scheduler = self.name,
                task_id = %id,
                kind = %meta.kind,
                priority = ?options.priority,
                "task enqueued"
            );

            let queued = QueuedTask { meta, body: task };
            match options.priority {
                TaskPriority::Normal => state.normal.push_back(queued),
                TaskPriority::Low => state.low.push_back(queued),
            }
            id
        };

        self.shared.wakeup.notify_one();
        Ok(id)
    }

    /// The task the worker is executing right now.
    pub fn current_task(&self) -> Option<TaskInfo> {
        self.shared
            .state
            .lock()
            .current
            .as_ref()
            .map(|meta| meta.info())
    }

    /// Snapshot of the running task (first) followed by every still valid
    /// queued task in dequeue order.
    pub fn list_tasks(&self) -> Vec<TaskInfo> {
        let state = self.shared.state.lock();
        let mut tasks = Vec::with_capacity(1 + state.normal.len() + state.low.len());
        if let Some(current) = &state.current {
            tasks.push(current.info());
        }
        tasks.extend(
            state
                .queued()
                .filter(|task| task.meta.is_valid())
                .map(|task| task.meta.info()),
        );
        tasks
    }

    /// Invalidate the task with `task_id` and every task spawned by it, if
    /// they belong to `owner` and are cancellable. Queued tasks are skipped
    /// when reached; a running task notices at its next checkpoint.
    pub fn invalidate(&self, task_id: TaskId, owner: TaskOwner) -> bool {
        let hit = {
            let state = self.shared.state.lock();
            let mut hit = false;
            for meta in state.metas() {
                if meta.options.owner != owner || !meta.options.cancellable {
                    continue;
                }
                if meta.id == task_id || meta.options.parent == Some(task_id) {
                    meta.token.cancel();
                    hit = true;
                }
            }
            hit
        };

        if hit {
            debug!(scheduler = self.name, task_id = %task_id, "task invalidated");
            self.shared.idle.notify_waiters();
        } else {
            debug!(scheduler = self.name, task_id = %task_id, "no task to invalidate");
        }
        hit
    }

    /// Invalidate every cancellable task of `owner` matching `predicate`.
    pub fn invalidate_where<F>(&self, owner: TaskOwner, predicate: F) -> usize
    where
        F: Fn(&TaskInfo) -> bool,
    {
        let count = {
            let state = self.shared.state.lock();
            let mut count = 0;
            for meta in state.metas() {
                if meta.options.owner != owner
                    || !meta.options.cancellable
                    || !meta.is_valid()
                {
                    continue;
                }
                if predicate(&meta.info()) {
                    meta.token.cancel();
                    count += 1;
                }
            }
            count
        };

        if count > 0 {
            self.shared.idle.notify_waiters();
        }
        count
    }

    pub fn is_busy(&self) -> bool {
        self.shared.state.lock().current.is_some()
    }

    /// Resolves once nothing is running and no valid task is queued.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            let idle = self.shared.state.lock().is_idle();
            if idle {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        if let Some(runtime) = self.worker.get_mut().take() {
            runtime.shutdown.cancel();
        }
    }
}

#[async_trait]
impl ManagedService for TaskScheduler {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn shutdown(&self) {
        self.stop().await;
    }

    fn inactivate(&self) {
        self.activation.inactivate();
    }

    fn reactivate(&self) {
        self.activation.reactivate();
    }
}

async fn run_worker(name: &'static str, shared: Arc<Shared>, shutdown: CancellationToken) {
    debug!(scheduler = name, "task worker running");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let next = {
            let mut state = shared.state.lock();
            let next = state.pop_next();
            if let Some(task) = &next {
                state.current = Some(Arc::clone(&task.meta));
            }
            next
        };

        let Some(task) = next else {
            shared.idle.notify_waiters();
            tokio::select! {
                _ = shared.wakeup.notified() => {}
                _ = shutdown.cancelled() => {}
            }
            continue;
        };

        execute(name, task).await;

        shared.state.lock().current = None;
        shared.idle.notify_waiters();
    }

    shared.idle.notify_waiters();
    debug!(scheduler = name, "task worker exited");
}

async fn execute(name: &'static str, task: QueuedTask) {
    let QueuedTask { meta, body } = task;
    let ctx = TaskContext::new(Arc::clone(&meta));

    debug!(
        scheduler = name,
        task_id = %meta.id,
        kind = %meta.kind,
        description = %meta.description,
        "running task"
    );

    match AssertUnwindSafe(body.run(&ctx)).catch_unwind().await {
        Ok(Ok(())) => {
            debug!(scheduler = name, task_id = %meta.id, "task finished");
        }
        Ok(Err(err)) if err.is_cancelled() => {
            info!(
                scheduler = name,
                task_id = %meta.id,
                description = %meta.description,
                "task aborted after invalidation"
            );
        }
        Ok(Err(err)) => {
            error!(
                scheduler = name,
                task_id = %meta.id,
                kind = %meta.kind,
                description = %meta.description,
                error = %err,
                "task failed"
            );
        }
        Err(panic) => {
            error!(
                scheduler = name,
                task_id = %meta.id,
                kind = %meta.kind,
                description = %meta.description,
                panic = panic_message(panic.as_ref()),
                "task panicked"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stopped_worker_is_not_reported_running_under_contention() {
        let scheduler = TaskScheduler::new("contended");
        scheduler.start().unwrap();
        assert!(scheduler.is_running());
        scheduler.stop().await;

        let (locked_tx, locked_rx) = mpsc::channel();
        let holder = {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || {
                let _guard = scheduler.worker.lock();
                locked_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
            })
        };
        locked_rx.recv().unwrap();

        assert!(!scheduler.is_running());
        holder.join().unwrap();
    }
}
