//! Ordered construction, shutdown and reactivation of long-lived services.
//!
//! Services register themselves with the [`LifecycleManager`] in construction
//! order, dependencies first. A shutdown walks the stack backwards so that
//! dependents stop before the services they rely on, then reactivates every
//! service in the original construction order so the same instances can be
//! started again without restarting the process.
//!
//! There is no ambient global: the [`ProcessContext`] is created once at
//! startup and handed to whatever constructs services.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{IndexError, Result};

/// A long-lived service whose lifetime is driven by the [`LifecycleManager`].
#[async_trait]
pub trait ManagedService: Send + Sync {
    fn name(&self) -> &'static str;

    /// Stop background work. Must leave the service restartable.
    async fn shutdown(&self);

    /// Mark the service unusable until [`ManagedService::reactivate`] runs.
    fn inactivate(&self) {}

    /// Undo [`ManagedService::inactivate`].
    fn reactivate(&self) {}
}

/// Activation flag shared by service implementations.
#[derive(Debug)]
pub struct ActivationState {
    name: &'static str,
    active: AtomicBool,
}

impl ActivationState {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            active: AtomicBool::new(true),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn inactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn reactivate(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// Fails with [`IndexError::ServiceInactive`] while inactivated.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(IndexError::ServiceInactive(self.name))
        }
    }
}

/// Stack of registered services for one server generation.
pub struct LifecycleManager {
    generation: u64,
    stack: Mutex<Vec<Arc<dyn ManagedService>>>,
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&'static str> = self.stack.lock().iter().map(|svc| svc.name()).collect();
        f.debug_struct("LifecycleManager")
            .field("generation", &self.generation)
            .field("services", &names)
            .finish()
    }
}

impl LifecycleManager {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            stack: Mutex::new(Vec::new()),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn register_service(&self, service: Arc<dyn ManagedService>) {
        let mut stack = self.stack.lock();
        debug!(
            service = service.name(),
            "registering service - {} -> {}",
            stack.len(),
            stack.len() + 1
        );
        stack.push(service);
    }

    pub fn len(&self) -> usize {
        self.stack.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.lock().is_empty()
    }

    /// Shut every registered service down in reverse construction order,
    /// then reactivate them in construction order. The stack is empty
    /// afterwards; restarted services register again.
    pub async fn shutdown_all(&self) {
        let mut stack = std::mem::take(&mut *self.stack.lock());
        info!(
            generation = self.generation,
            services = stack.len(),
            "shutting down services"
        );

        let mut reactivate = Vec::with_capacity(stack.len());
        while let Some(service) = stack.pop() {
            debug!(service = service.name(), "shutting down");
            service.shutdown().await;
            service.inactivate();
            reactivate.push(service);
        }

        while let Some(service) = reactivate.pop() {
            debug!(service = service.name(), "reactivating");
            service.reactivate();
        }

        debug!(generation = self.generation, "shutdown complete");
    }
}

/// Process-wide holder of the current [`LifecycleManager`].
///
/// A complete shutdown drops the manager; the next access creates a fresh one
/// with a new generation number.
pub struct ProcessContext {
    manager: Mutex<Option<Arc<LifecycleManager>>>,
    generations: AtomicU64,
}

impl fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessContext")
            .field("manager", &*self.manager.lock())
            .field("generations", &self.generations.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for ProcessContext {
    fn default() -> Self {
        Self {
            manager: Mutex::new(None),
            generations: AtomicU64::new(0),
        }
    }
}

impl ProcessContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current manager, created on first use.
    pub fn lifecycle(&self) -> Arc<LifecycleManager> {
        let mut guard = self.manager.lock();
        guard
            .get_or_insert_with(|| {
                let generation = self.generations.fetch_add(1, Ordering::AcqRel);
                debug!(generation, "creating lifecycle manager");
                Arc::new(LifecycleManager::new(generation))
            })
            .clone()
    }

    pub fn register_service(&self, service: Arc<dyn ManagedService>) {
        self.lifecycle().register_service(service);
    }

    /// Shut down every registered service. With `complete` the manager itself
    /// is released as well.
    pub async fn shutdown_all(&self, complete: bool) {
        let manager = self.manager.lock().clone();
        if let Some(manager) = manager {
            manager.shutdown_all().await;
        }
        if complete {
            self.manager.lock().take();
            info!("lifecycle manager released");
        }
    }
}
