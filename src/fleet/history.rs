//! Job history: the account's job list, refreshed on demand or on a timer.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

use crate::contract::{FleetApi, Job};
use crate::status::StatusHub;

/// Shortest polling interval accepted by [`JobHistory::set_refresh_interval`].
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

struct Inner {
    api: Arc<dyn FleetApi>,
    status: StatusHub,
    jobs: Mutex<Vec<Job>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<Arc<Vec<Job>>>,
}

#[derive(Clone)]
pub struct JobHistory {
    inner: Arc<Inner>,
}

impl JobHistory {
    pub fn new(api: Arc<dyn FleetApi>, status: StatusHub) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                api,
                status,
                jobs: Mutex::new(Vec::new()),
                timer: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.inner.jobs.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<Job>>> {
        self.inner.events.subscribe()
    }

    /// Fetch the job list now. Failures go to the status hub; the old list stays.
    pub async fn refresh(&self) {
        match self.inner.api.list_jobs().await {
            Ok(jobs) => {
                debug!(jobs = jobs.len(), "job history refreshed");
                *self.inner.jobs.lock() = jobs.clone();
                let _ = self.inner.events.send(Arc::new(jobs));
            }
            Err(e) => self.inner.status.error(format!("ERROR: {e}")),
        }
    }

    /// Replace the polling timer. `None` or zero disables polling; anything shorter
    /// than [`MIN_REFRESH_INTERVAL`] is raised to it. An enabled timer fetches at once.
    pub fn set_refresh_interval(&self, interval: Option<Duration>) {
        if let Some(previous) = self.inner.timer.lock().take() {
            previous.abort();
        }

        let Some(interval) = interval.filter(|i| !i.is_zero()) else {
            info!("job history polling disabled");
            return;
        };
        let interval = interval.max(MIN_REFRESH_INTERVAL);
        info!(?interval, "job history polling enabled");

        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.refresh().await;
            let start = time::Instant::now() + interval;
            let mut ticker = time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if this.inner.api.has_valid_token() {
                    this.refresh().await;
                }
            }
        });
        *self.inner.timer.lock() = Some(handle);
    }

    pub fn is_polling(&self) -> bool {
        self.inner
            .timer
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Clear the job list and tell subscribers.
    pub fn logged_out(&self) {
        self.inner.jobs.lock().clear();
        let _ = self.inner.events.send(Arc::new(Vec::new()));
    }
}
