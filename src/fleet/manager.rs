//! # PrintManager: keeps the fleet state in sync with the remote fleet API
//!
//! Two loops run once [`PrintManager::start`] is called:
//!
//! - the printer loop refetches the printer list every `printer_refresh` and, from it,
//!   every printer's status, the printer types, the membership lists and the members;
//! - the status loop ticks every `status_tick` and refetches only the printers the
//!   [`RefreshPolicy`] says are due.
//!
//! A printer-list refresh is a [`FetchWave`]: its branches run concurrently and the
//! subscribers see a single snapshot once every branch has settled. Outside a wave,
//! each status or job update notifies on its own.
//!
//! Responses are versioned by the time their request was issued. A status response is
//! dropped if a newer one is already cached; a printer list is dropped if a list
//! requested later has already been applied. Logging out starts a new epoch; whatever
//! was fetched under an earlier epoch is dropped on arrival.
//!
//! ## Error Handling
//! Fetch failures in the loops are logged and sent to the [`StatusHub`] as error
//! messages; the loops keep running and the next tick tries again. Commands return
//! their failure to the caller.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::schedule::{RefreshDecision, RefreshPolicy};
use super::state::{FleetState, PrinterView};
use super::wave::{DataKind, FetchWave};
use crate::config::FleetConfig;
use crate::contract::{FleetApi, JobCommand, Printer, PrinterId, PrinterStatus};
use crate::error::{Error, Result};
use crate::status::StatusHub;

const CHANNEL_CAPACITY: usize = 64;

/// Delivered to subscribers on every change.
#[derive(Debug, Clone)]
pub enum FleetEvent {
    Changed(Arc<FleetState>),
}

#[derive(Default)]
struct Shared {
    state: FleetState,
    /// Issue time of the request whose status is cached, per printer.
    fetched_at: HashMap<PrinterId, Instant>,
    wave: FetchWave,
    /// Bumped by `logged_out`.
    epoch: u64,
    lists_issued: u64,
    list_applied: u64,
}

struct Inner {
    api: Arc<dyn FleetApi>,
    status: StatusHub,
    config: FleetConfig,
    policy: RefreshPolicy,
    shared: Mutex<Shared>,
    events: broadcast::Sender<FleetEvent>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

/// Cloneable handle; clones share state and loops.
#[derive(Clone)]
pub struct PrintManager {
    inner: Arc<Inner>,
}

impl PrintManager {
    pub fn new(api: Arc<dyn FleetApi>, config: FleetConfig, status: StatusHub) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                api,
                status,
                policy: RefreshPolicy::from(&config),
                config,
                shared: Mutex::new(Shared::default()),
                events,
                loops: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> FleetState {
        self.inner.shared.lock().state.clone()
    }

    /// Printers joined with type, owner, membership, status and job; sorted by name.
    pub fn printer_data(&self) -> Vec<PrinterView> {
        self.inner.shared.lock().state.printer_data()
    }

    /// Start (or restart) both polling loops.
    pub fn start(&self) {
        self.stop();

        let printers = {
            let this = self.clone();
            tokio::spawn(async move {
                let mut interval = time::interval(this.inner.config.printer_refresh());
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    if this.inner.api.has_valid_token() {
                        this.refresh_printers().await;
                    }
                }
            })
        };
        let status = {
            let this = self.clone();
            tokio::spawn(async move {
                let mut interval = time::interval(this.inner.config.status_tick());
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    if this.inner.api.has_valid_token() {
                        this.tick().await;
                    }
                }
            })
        };

        info!(
            printer_refresh = ?self.inner.config.printer_refresh(),
            status_tick = ?self.inner.config.status_tick(),
            "fleet polling started"
        );
        self.inner.loops.lock().extend([printers, status]);
    }

    /// Abort the polling loops. A no-op when they are not running.
    pub fn stop(&self) {
        let handles: Vec<JoinHandle<()>> = self.inner.loops.lock().drain(..).collect();
        if !handles.is_empty() {
            debug!(loops = handles.len(), "fleet polling stopped");
        }
        for handle in handles {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.loops.lock().iter().any(|h| !h.is_finished())
    }

    /// Manual refresh; ignored without a valid token.
    pub async fn refresh(&self) {
        if self.inner.api.has_valid_token() {
            self.refresh_printers().await;
        }
    }

    /// Forget everything (the account went away) and tell subscribers.
    pub fn logged_out(&self) {
        let snapshot = {
            let mut shared = self.inner.shared.lock();
            let shared = &mut *shared;
            shared.epoch += 1;
            shared.state = FleetState::default();
            shared.fetched_at.clear();
            shared.wave.cancel();
            shared.state.clone()
        };
        info!("fleet state cleared");
        self.notify(snapshot);
    }

    /// One status tick: fetch the printers that are due, count the others down.
    pub async fn tick(&self) {
        self.refresh_status(false, None).await;
    }

    /// Fetch the printer list, then status, types, membership and members as one wave.
    pub async fn refresh_printers(&self) {
        let (issued, epoch) = {
            let mut shared = self.inner.shared.lock();
            shared.lists_issued += 1;
            (shared.lists_issued, shared.epoch)
        };

        let printers = match self.inner.api.list_printers().await {
            Ok(printers) => printers,
            Err(e) => {
                self.inner.status.error(format!("ERROR: {e}"));
                return;
            }
        };

        let generation = {
            let mut shared = self.inner.shared.lock();
            if shared.epoch != epoch || issued < shared.list_applied {
                debug!(issued, applied = shared.list_applied, "dropping stale printer list");
                return;
            }
            shared.list_applied = issued;
            info!(printers = printers.len(), "printer list refreshed");
            shared.state.printers = printers;
            let generation = shared.wave.begin(&DataKind::ALL);
            shared.wave.settle(generation, DataKind::Printers);
            generation
        };

        futures::join!(
            self.refresh_status(true, Some(generation)),
            self.refresh_printer_types(generation),
            self.refresh_printer_members(generation),
        );
    }

    /// Refetch status. `force` fetches every printer and rebuilds the cache; otherwise
    /// the refresh policy picks the printers that are due.
    async fn refresh_status(&self, force: bool, wave: Option<u64>) {
        let issued = Instant::now();
        let (due, counted_down, epoch) = {
            let mut shared = self.inner.shared.lock();
            let shared = &mut *shared;
            let epoch = shared.epoch;
            if force {
                let due: Vec<PrinterId> = shared
                    .state
                    .printers
                    .iter()
                    .map(|p| p.printer_id.clone())
                    .collect();
                (due, false, epoch)
            } else {
                let mut due = Vec::new();
                let mut counted_down = false;
                let ids: Vec<PrinterId> = shared
                    .state
                    .printers
                    .iter()
                    .map(|p| p.printer_id.clone())
                    .collect();
                for id in ids {
                    let elapsed = shared
                        .fetched_at
                        .get(&id)
                        .map(|at| issued.saturating_duration_since(*at));
                    match self.inner.policy.decide(shared.state.status.get(&id), elapsed) {
                        RefreshDecision::Fetch => due.push(id),
                        RefreshDecision::CountDown => {
                            counted_down |= shared.state.count_down(&id);
                        }
                        RefreshDecision::Idle => {}
                    }
                }
                (due, counted_down, epoch)
            }
        };

        if due.is_empty() {
            match wave {
                Some(generation) => self.settle(generation, DataKind::Status),
                None if counted_down => self.changed(),
                None => {}
            }
            return;
        }

        debug!(printers = due.len(), force, "fetching printer status");
        let api = &self.inner.api;
        let results = join_all(due.iter().map(|id| async move {
            (id, api.printer_status(id).await)
        }))
        .await;

        let mut applied = counted_down;
        let mut errors = Vec::new();
        {
            let mut shared = self.inner.shared.lock();
            let shared = &mut *shared;
            if shared.epoch != epoch {
                debug!(printers = due.len(), "dropping status fetched before logout");
                return;
            }
            if force {
                // Rebuild from this response, keeping only entries requested after it.
                shared.fetched_at.retain(|_, at| *at > issued);
                let fetched_at = &shared.fetched_at;
                shared.state.status.retain(|id, _| fetched_at.contains_key(id));
            }
            for (id, result) in results {
                match result {
                    Ok(status) => {
                        if apply_status(shared, id, status, issued) {
                            applied = true;
                        }
                    }
                    Err(e) => errors.push(format!("ERROR: {e}")),
                }
            }
        }
        for error in errors {
            self.inner.status.error(error);
        }

        let jobs_changed = self.refresh_jobs().await;
        match wave {
            Some(generation) => self.settle(generation, DataKind::Status),
            None if applied || jobs_changed => self.changed(),
            None => {}
        }
    }

    async fn refresh_printer_types(&self, generation: u64) {
        let (missing, epoch): (Vec<String>, u64) = {
            let shared = self.inner.shared.lock();
            let missing: BTreeSet<String> = shared
                .state
                .printers
                .iter()
                .map(|p| p.type_id.clone())
                .filter(|id| !shared.state.printer_types.contains_key(id))
                .collect();
            (missing.into_iter().collect(), shared.epoch)
        };

        if !missing.is_empty() {
            let api = &self.inner.api;
            let results = join_all(missing.iter().map(|id| api.printer_type(id))).await;
            let mut errors = Vec::new();
            {
                let mut shared = self.inner.shared.lock();
                if shared.epoch != epoch {
                    return;
                }
                for (id, result) in missing.iter().zip(results) {
                    match result {
                        Ok(printer_type) => {
                            shared.state.printer_types.insert(id.clone(), printer_type);
                        }
                        Err(e) => errors.push(format!("ERROR: {e}")),
                    }
                }
            }
            for error in errors {
                self.inner.status.error(error);
            }
        }
        self.settle(generation, DataKind::PrinterTypes);
    }

    async fn refresh_printer_members(&self, generation: u64) {
        let (ids, epoch): (Vec<PrinterId>, u64) = {
            let shared = self.inner.shared.lock();
            let ids = shared.state.printers.iter().map(|p| p.printer_id.clone()).collect();
            (ids, shared.epoch)
        };

        if !ids.is_empty() {
            let api = &self.inner.api;
            let results = join_all(ids.iter().map(|id| api.printer_members(id))).await;
            let mut errors = Vec::new();
            {
                let mut shared = self.inner.shared.lock();
                if shared.epoch != epoch {
                    return;
                }
                let mut membership = HashMap::new();
                for (id, result) in ids.iter().zip(results) {
                    match result {
                        Ok(members) => {
                            membership.insert(id.clone(), members);
                        }
                        Err(e) => errors.push(format!("ERROR: {e}")),
                    }
                }
                shared.state.printer_members = membership;
            }
            for error in errors {
                self.inner.status.error(error);
            }
        }
        self.settle(generation, DataKind::PrinterMembers);
        self.refresh_members(generation).await;
    }

    /// Fetch profiles of members seen in the membership lists but not cached yet.
    async fn refresh_members(&self, generation: u64) {
        let (missing, epoch): (Vec<String>, u64) = {
            let shared = self.inner.shared.lock();
            let missing: BTreeSet<String> = shared
                .state
                .printer_members
                .values()
                .flatten()
                .map(|m| m.member_id.clone())
                .filter(|id| !shared.state.members.contains_key(id))
                .collect();
            (missing.into_iter().collect(), shared.epoch)
        };

        if !missing.is_empty() {
            let api = &self.inner.api;
            let results = join_all(missing.iter().map(|id| api.member_profile(id))).await;
            let mut errors = Vec::new();
            {
                let mut shared = self.inner.shared.lock();
                if shared.epoch != epoch {
                    return;
                }
                for (id, result) in missing.iter().zip(results) {
                    match result {
                        Ok(member) => {
                            shared.state.members.insert(id.clone(), member);
                        }
                        Err(e) => errors.push(format!("ERROR: {e}")),
                    }
                }
            }
            for error in errors {
                self.inner.status.error(error);
            }
        }
        self.settle(generation, DataKind::Members);
    }

    /// Fetch the job of every printer whose cached status names one. Returns whether
    /// the job map changed; the caller notifies.
    async fn refresh_jobs(&self) -> bool {
        let (active, epoch) = {
            let shared = self.inner.shared.lock();
            (shared.state.active_jobs(), shared.epoch)
        };
        if active.is_empty() {
            let mut shared = self.inner.shared.lock();
            let had_jobs = !shared.state.jobs.is_empty();
            shared.state.jobs.clear();
            return had_jobs;
        }

        let api = &self.inner.api;
        let results = join_all(active.iter().map(|(_, job_id)| api.job_status(job_id))).await;
        let mut errors = Vec::new();
        {
            let mut shared = self.inner.shared.lock();
            if shared.epoch != epoch {
                return false;
            }
            let mut jobs = HashMap::new();
            for ((printer_id, _), result) in active.iter().zip(results) {
                match result {
                    Ok(job) => {
                        jobs.insert(printer_id.clone(), job);
                    }
                    Err(e) => {
                        errors.push(format!("ERROR: {e}"));
                        if let Some(previous) = shared.state.jobs.remove(printer_id) {
                            jobs.insert(printer_id.clone(), previous);
                        }
                    }
                }
            }
            shared.state.jobs = jobs;
        }
        for error in errors {
            self.inner.status.error(error);
        }
        true
    }

    pub async fn pause_job(&self, printer_id: &str) -> Result<PrinterStatus> {
        self.send_job_command(printer_id, JobCommand::Pause).await
    }

    pub async fn resume_job(&self, printer_id: &str) -> Result<PrinterStatus> {
        self.send_job_command(printer_id, JobCommand::Resume).await
    }

    pub async fn cancel_job(&self, printer_id: &str) -> Result<PrinterStatus> {
        self.send_job_command(printer_id, JobCommand::Cancel).await
    }

    /// Send a job command, then poll the printer until its reported status moves away
    /// from the one cached when the command was sent.
    pub async fn send_job_command(
        &self,
        printer_id: &str,
        command: JobCommand,
    ) -> Result<PrinterStatus> {
        let (initial, job_id, epoch) = {
            let shared = self.inner.shared.lock();
            if !shared.state.printers.iter().any(|p| p.printer_id == printer_id) {
                return Err(Error::UnknownPrinter(printer_id.to_owned()));
            }
            let status = shared.state.status.get(printer_id);
            (
                status.and_then(|s| s.printer_status()).map(str::to_owned),
                status.and_then(|s| s.job_id()).map(str::to_owned),
                shared.epoch,
            )
        };
        let Some(job_id) = job_id else {
            warn!(printer = printer_id, command = command.as_str(), "no active job");
            return Err(Error::NoActiveJob);
        };

        info!(
            printer = printer_id,
            job = %job_id,
            command = command.as_str(),
            "sending job command"
        );
        self.inner
            .api
            .send_job_command(printer_id, &job_id, command)
            .await?;

        let attempts = self.inner.config.command_poll_attempts;
        for attempt in 0..attempts {
            if attempt > 0 {
                time::sleep(self.inner.config.command_poll_interval()).await;
            }
            let issued = Instant::now();
            let status = self.inner.api.printer_status(printer_id).await?;
            if status.printer_status() != initial.as_deref() {
                info!(
                    printer = printer_id,
                    from = ?initial,
                    to = ?status.printer_status(),
                    attempt,
                    "job command took effect"
                );
                let applied = {
                    let mut shared = self.inner.shared.lock();
                    shared.epoch == epoch
                        && apply_status(&mut shared, printer_id, status.clone(), issued)
                };
                if applied {
                    self.changed();
                }
                return Ok(status);
            }
        }

        warn!(
            printer = printer_id,
            command = command.as_str(),
            attempts,
            "job command timed out"
        );
        Err(Error::Timeout { attempts })
    }

    /// Register a printer with its registration code, then refresh the printer list.
    pub async fn register_printer(&self, name: &str, code: &str) -> Result<Printer> {
        let printer = self.inner.api.register_printer(name, code).await?;
        info!(printer = %printer.printer_id, name, "printer registered");
        self.refresh_printers().await;
        Ok(printer)
    }

    /// Unregister a printer, then refresh the printer list.
    pub async fn delete_printer(&self, printer_id: &str) -> Result<()> {
        self.inner.api.unregister_printer(printer_id).await?;
        info!(printer = printer_id, "printer unregistered");
        self.refresh_printers().await;
        Ok(())
    }

    /// Reset a printer; its status is refetched on the next tick.
    pub async fn reset_printer(&self, printer_id: &str) -> Result<()> {
        self.inner.api.reset_printer(printer_id).await?;
        self.inner.shared.lock().fetched_at.remove(printer_id);
        info!(printer = printer_id, "printer reset");
        Ok(())
    }

    fn settle(&self, generation: u64, kind: DataKind) {
        let snapshot = {
            let mut shared = self.inner.shared.lock();
            if shared.wave.settle(generation, kind) {
                Some(shared.state.clone())
            } else {
                None
            }
        };
        if let Some(snapshot) = snapshot {
            debug!(generation, "fetch wave complete");
            self.notify(snapshot);
        }
    }

    /// A change outside a wave. Folded into the wave's notification if one is open.
    fn changed(&self) {
        let snapshot = {
            let shared = self.inner.shared.lock();
            let snapshot = shared.wave.is_settled().then(|| shared.state.clone());
            snapshot
        };
        if let Some(snapshot) = snapshot {
            self.notify(snapshot);
        }
    }

    fn notify(&self, snapshot: FleetState) {
        let _ = self.inner.events.send(FleetEvent::Changed(Arc::new(snapshot)));
    }
}

/// Cache `status` for `printer_id` unless a newer request's status is already cached.
fn apply_status(
    shared: &mut Shared,
    printer_id: &str,
    status: PrinterStatus,
    issued: Instant,
) -> bool {
    if let Some(cached) = shared.fetched_at.get(printer_id) {
        if *cached > issued {
            debug!(printer = printer_id, "dropping stale status");
            return false;
        }
    }
    shared.fetched_at.insert(printer_id.to_owned(), issued);
    shared.state.status.insert(printer_id.to_owned(), status);
    true
}
