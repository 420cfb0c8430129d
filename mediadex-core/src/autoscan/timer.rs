use std::collections::HashMap;
use std::fmt;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::directory::ScanMode;
use crate::lifecycle::{ActivationState, ManagedService};
use crate::types::ids::ScanId;

/// Identifies a timer subscription. Delivered back to the subscriber on every
/// tick so it can tell which directory is due.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TimerParameter {
    pub mode: ScanMode,
    pub scan_id: Option<ScanId>,
}

pub trait TimerSubscriber: Send + Sync {
    fn timer_notify(&self, parameter: TimerParameter);
}

/// Periodic callback service used for timed rescans.
pub trait Timer: Send + Sync {
    /// Call `subscriber` every `interval` with `parameter`. Subscribing again
    /// with an equal parameter replaces the earlier subscription.
    fn add_subscriber(
        &self,
        subscriber: Weak<dyn TimerSubscriber>,
        interval: Duration,
        parameter: TimerParameter,
    );

    fn remove_subscriber(&self, parameter: TimerParameter);
}

const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// [`Timer`] backed by one tokio interval task per subscription.
pub struct IntervalTimer {
    subscriptions: Mutex<HashMap<TimerParameter, CancellationToken>>,
    activation: ActivationState,
}

impl fmt::Debug for IntervalTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("IntervalTimer");
        match self.subscriptions.try_lock() {
            Some(subscriptions) => {
                debug.field("subscriptions", &subscriptions.len());
            }
            None => {
                debug.field("subscriptions", &"<locked>");
            }
        }
        debug
            .field("active", &self.activation.is_active())
            .finish()
    }
}

impl Default for IntervalTimer {
    fn default() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            activation: ActivationState::new("timer"),
        }
    }
}

impl IntervalTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn is_subscribed(&self, parameter: &TimerParameter) -> bool {
        self.subscriptions.lock().contains_key(parameter)
    }

    fn cancel_all(&self) {
        for (_, token) in self.subscriptions.lock().drain() {
            token.cancel();
        }
    }
}

impl Timer for IntervalTimer {
    fn add_subscriber(
        &self,
        subscriber: Weak<dyn TimerSubscriber>,
        interval: Duration,
        parameter: TimerParameter,
    ) {
        if !self.activation.is_active() {
            debug!(?parameter, "timer inactive, subscription ignored");
            return;
        }

        let period = interval.max(MIN_INTERVAL);
        let token = CancellationToken::new();
        if let Some(previous) = self.subscriptions.lock().insert(parameter, token.clone()) {
            previous.cancel();
        }
        debug!(?parameter, period_secs = period.as_secs(), "timer subscription added");

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(subscriber) = subscriber.upgrade() else {
                    break;
                };
                subscriber.timer_notify(parameter);
            }
        });
    }

    fn remove_subscriber(&self, parameter: TimerParameter) {
        if let Some(token) = self.subscriptions.lock().remove(&parameter) {
            token.cancel();
            debug!(?parameter, "timer subscription removed");
        }
    }
}

#[async_trait]
impl ManagedService for IntervalTimer {
    fn name(&self) -> &'static str {
        "timer"
    }

    async fn shutdown(&self) {
        self.cancel_all();
        info!("timer subscriptions cancelled");
    }

    fn inactivate(&self) {
        self.activation.inactivate();
    }

    fn reactivate(&self) {
        self.activation.reactivate();
    }
}

impl Drop for IntervalTimer {
    fn drop(&mut self) {
        for (_, token) in self.subscriptions.get_mut().drain() {
            token.cancel();
        }
    }
}
