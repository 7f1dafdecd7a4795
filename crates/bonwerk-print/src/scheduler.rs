// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Job scheduler: per-device priority queues drained one job at a time
// through the exclusive transport region.
//
// Submission is strict: a role without an enabled mapping, or whose device
// the directory does not know, is rejected before any job exists. Accepted
// jobs go to their device's queue ordered by priority, then by submission
// sequence. A retried job keeps its sequence, so it stays ahead of later
// submissions of the same priority.
//
// Each device queue has at most one worker task, spawned lazily. A worker
// takes the transport permit, pops the head job, connects, transmits,
// records the outcome and only then releases the permit, so no two jobs are
// ever `Printing` at the same time.
//
// Lock order: the scheduler state lock is never held across an await, and
// nothing is emitted while it is held.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use bonwerk_core::config::OrchestratorConfig;
use bonwerk_core::error::{BonwerkError, Result};
use bonwerk_core::types::{
    DeviceId, DeviceStatus, EventKind, JobId, JobPriority, JobStatus, PrintEvent, PrintJob,
    PrintPayload, PrintRequest, Role,
};
use bonwerk_store::{JobAction, JobLog};

use crate::connection::ConnectionManager;
use crate::directory::DeviceDirectory;
use crate::encoding::{TicketEncoder, encode_for_role};
use crate::events::EventBus;
use crate::health::HealthTracker;
use crate::registry::RoleRegistry;

// ---------------------------------------------------------------------------
// Device queue
// ---------------------------------------------------------------------------

/// Position of a job in a device queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub priority: JobPriority,
    /// Submission sequence; lower runs first within a priority.
    pub seq: u64,
}

/// Pending jobs of one device, kept sorted by (priority desc, seq asc).
#[derive(Debug, Default)]
pub struct DeviceQueue {
    entries: Vec<QueueEntry>,
    is_processing: bool,
    last_processed: Option<DateTime<Utc>>,
}

impl DeviceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping the order. Ties go behind entries with a lower seq.
    pub fn push(&mut self, entry: QueueEntry) {
        let at = self.entries.partition_point(|e| {
            e.priority > entry.priority || (e.priority == entry.priority && e.seq < entry.seq)
        });
        self.entries.insert(at, entry);
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    pub fn remove(&mut self, job_id: &JobId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| &e.job_id != job_id);
        self.entries.len() != before
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.entries.iter().map(|e| e.job_id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a worker currently owns this queue.
    pub fn is_processing(&self) -> bool {
        self.is_processing
    }

    pub fn last_processed(&self) -> Option<DateTime<Utc>> {
        self.last_processed
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: usize,
    pub pending: usize,
    pub printing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    fn add(&mut self, status: JobStatus) {
        self.total += 1;
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Printing => self.printing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub jobs: StatusCounts,
    /// Devices whose queue has a worker right now.
    pub active_queues: usize,
    pub queued: usize,
    pub connected_devices: Vec<DeviceId>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStatistics {
    pub by_role: BTreeMap<Role, StatusCounts>,
    pub by_priority: BTreeMap<JobPriority, StatusCounts>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceConnectionStatus {
    pub device_id: DeviceId,
    pub name: String,
    /// `None` when the device is mapped but missing from the directory.
    pub status: Option<DeviceStatus>,
    pub connected: bool,
    pub roles: Vec<Role>,
    pub queued: usize,
    pub last_processed: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Enough consecutive failures that staff should look at the printer.
    pub struggling: bool,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct JobRecord {
    job: PrintJob,
    seq: u64,
}

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<JobId, JobRecord>,
    queues: HashMap<DeviceId, DeviceQueue>,
    workers: HashMap<DeviceId, JoinHandle<()>>,
    health: HealthTracker,
    next_seq: u64,
}

impl SchedulerState {
    /// Jobs waiting in any queue.
    fn backlog(&self) -> usize {
        self.queues.values().map(DeviceQueue::len).sum()
    }

    /// Forget the oldest terminal jobs beyond `keep`. Returns how many went.
    fn prune_finished(&mut self, keep: usize) -> usize {
        let mut finished: Vec<(u64, JobId)> = self
            .jobs
            .iter()
            .filter(|(_, r)| r.job.is_terminal())
            .map(|(id, r)| (r.seq, *id))
            .collect();
        if finished.len() <= keep {
            return 0;
        }
        finished.sort_unstable_by_key(|(seq, _)| *seq);
        let excess = finished.len() - keep;
        for (_, id) in &finished[..excess] {
            self.jobs.remove(id);
        }
        excess
    }
}

struct SchedulerShared {
    config: OrchestratorConfig,
    registry: Arc<RoleRegistry>,
    directory: Arc<DeviceDirectory>,
    connections: Arc<ConnectionManager>,
    encoder: Arc<dyn TicketEncoder>,
    events: EventBus,
    job_log: Option<Arc<JobLog>>,
    running: AtomicBool,
    state: Mutex<SchedulerState>,
}

/// Outcome of finishing an attempt, decided under the state lock.
enum Finish {
    Completed,
    Retry { attempt: u32, error: String },
    Failed { error: String },
}

pub struct JobScheduler {
    shared: Arc<SchedulerShared>,
}

impl JobScheduler {
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<RoleRegistry>,
        directory: Arc<DeviceDirectory>,
        connections: Arc<ConnectionManager>,
        encoder: Arc<dyn TicketEncoder>,
        events: EventBus,
        job_log: Option<Arc<JobLog>>,
    ) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                config,
                registry,
                directory,
                connections,
                encoder,
                events,
                job_log,
                running: AtomicBool::new(false),
                state: Mutex::new(SchedulerState::default()),
            }),
        }
    }

    /// Accept submissions and drain any queues left from before a stop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let waiting: Vec<DeviceId> = {
            let mut state = self.shared.state.lock().expect("scheduler lock poisoned");
            state
                .queues
                .iter_mut()
                .filter(|(_, q)| !q.is_empty() && !q.is_processing)
                .map(|(id, q)| {
                    q.is_processing = true;
                    id.clone()
                })
                .collect()
        };
        for device_id in waiting {
            launch_worker(&self.shared, device_id);
        }
        info!("job scheduler started");
    }

    /// Stop accepting submissions and wait for in-flight jobs to finish.
    ///
    /// Pending jobs stay queued and resume on the next `start`.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let workers: Vec<JoinHandle<()>> = {
            let mut state = self.shared.state.lock().expect("scheduler lock poisoned");
            state.workers.drain().map(|(_, h)| h).collect()
        };
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "queue worker ended abnormally");
            }
        }
        info!("job scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Queue a payload for `role`.
    ///
    /// Fails without creating a job when the role has no enabled mapping or
    /// the mapped device is unknown. Must be called from within a Tokio
    /// runtime.
    pub fn submit(&self, role: Role, payload: PrintPayload, priority: JobPriority) -> Result<JobId> {
        let shared = &self.shared;
        if !shared.running.load(Ordering::SeqCst) {
            return Err(BonwerkError::SchedulerStopped);
        }

        let mapping = shared.registry.resolve(role)?;
        if !shared.directory.contains(&mapping.device_id) {
            return Err(BonwerkError::UnknownDevice {
                role,
                device: mapping.device_id,
            });
        }

        let job = PrintJob::new(
            role,
            mapping.device_id.clone(),
            payload,
            priority,
            shared.config.max_retries,
        );
        let job_id = job.id;
        let device_id = job.device_id.clone();
        let (queued, idle) = {
            let mut state = shared.state.lock().expect("scheduler lock poisoned");
            let seq = state.next_seq;
            state.next_seq += 1;
            state.jobs.insert(job_id, JobRecord { job: job.clone(), seq });
            let queue = state.queues.entry(device_id.clone()).or_default();
            queue.push(QueueEntry {
                job_id,
                priority,
                seq,
            });
            // Claim the queue now so a concurrent submit cannot spawn twice.
            let idle = !queue.is_processing;
            queue.is_processing = true;
            let queued = queue.len();
            shared.connections.set_backlog(state.backlog());
            (queued, idle)
        };

        debug!(job_id = %job_id, role = %role, device = %device_id, ?priority, "job queued");
        shared.log(&job, JobAction::Submitted, None);
        shared.registry.touch(role);
        shared.events.emit(
            PrintEvent::job(EventKind::QueueUpdated, &job).with_message(format!("queued ({queued})")),
        );
        if idle {
            launch_worker(shared, device_id);
        }
        Ok(job_id)
    }

    /// Submit several tickets for one order. Each role is routed
    /// independently; one failing does not undo the others.
    pub fn print_for_order(&self, requests: Vec<PrintRequest>) -> Vec<Result<JobId>> {
        requests
            .into_iter()
            .map(|r| {
                let role = r.role;
                self.submit(r.role, r.payload, r.priority).inspect_err(|e| {
                    warn!(role = %role, error = %e, "order ticket rejected");
                })
            })
            .collect()
    }

    /// Cancel a pending job.
    pub fn cancel(&self, job_id: &JobId) -> Result<()> {
        let job = {
            let mut state = self.shared.state.lock().expect("scheduler lock poisoned");
            let job = cancel_locked(&mut state, job_id)?;
            self.shared.settle_locked(&mut state);
            job
        };
        info!(job_id = %job_id, "job cancelled");
        self.shared.log(&job, JobAction::Cancelled, None);
        self.shared
            .events
            .emit(PrintEvent::job(EventKind::QueueUpdated, &job).with_message("cancelled"));
        Ok(())
    }

    /// Cancel every pending job queued for `device_id`.
    pub fn clear_queue(&self, device_id: &DeviceId) -> Vec<JobId> {
        let cancelled: Vec<PrintJob> = {
            let mut state = self.shared.state.lock().expect("scheduler lock poisoned");
            let ids = state
                .queues
                .get(device_id)
                .map(DeviceQueue::job_ids)
                .unwrap_or_default();
            let cancelled = ids
                .iter()
                .filter_map(|id| cancel_locked(&mut state, id).ok())
                .collect();
            self.shared.settle_locked(&mut state);
            cancelled
        };
        for job in &cancelled {
            self.shared.log(job, JobAction::Cancelled, Some("queue cleared"));
        }
        if !cancelled.is_empty() {
            info!(device = %device_id, count = cancelled.len(), "queue cleared");
            self.shared.events.emit(
                PrintEvent::device(EventKind::QueueUpdated, device_id)
                    .with_message(format!("cleared {}", cancelled.len())),
            );
        }
        cancelled.into_iter().map(|j| j.id).collect()
    }

    pub fn job(&self, job_id: &JobId) -> Option<PrintJob> {
        self.shared
            .state
            .lock()
            .expect("scheduler lock poisoned")
            .jobs
            .get(job_id)
            .map(|r| r.job.clone())
    }

    /// All jobs still held in memory, oldest first.
    pub fn jobs(&self) -> Vec<PrintJob> {
        let state = self.shared.state.lock().expect("scheduler lock poisoned");
        let mut records: Vec<&JobRecord> = state.jobs.values().collect();
        records.sort_by_key(|r| r.seq);
        records.into_iter().map(|r| r.job.clone()).collect()
    }

    /// Pending job ids for `device_id` in the order they will run.
    pub fn queue_snapshot(&self, device_id: &DeviceId) -> Vec<JobId> {
        self.shared
            .state
            .lock()
            .expect("scheduler lock poisoned")
            .queues
            .get(device_id)
            .map(DeviceQueue::job_ids)
            .unwrap_or_default()
    }

    pub fn queue_len(&self, device_id: &DeviceId) -> usize {
        self.shared
            .state
            .lock()
            .expect("scheduler lock poisoned")
            .queues
            .get(device_id)
            .map_or(0, DeviceQueue::len)
    }

    /// Drop terminal jobs from memory. Returns how many were dropped.
    pub fn clear_finished(&self) -> usize {
        let mut state = self.shared.state.lock().expect("scheduler lock poisoned");
        let before = state.jobs.len();
        state.jobs.retain(|_, r| !r.job.is_terminal());
        before - state.jobs.len()
    }

    pub fn status(&self) -> SchedulerStatus {
        let (jobs, active_queues, queued) = {
            let state = self.shared.state.lock().expect("scheduler lock poisoned");
            let mut counts = StatusCounts::default();
            for record in state.jobs.values() {
                counts.add(record.job.status);
            }
            let active = state.queues.values().filter(|q| q.is_processing()).count();
            let queued = state.queues.values().map(DeviceQueue::len).sum::<usize>();
            (counts, active, queued)
        };
        SchedulerStatus {
            running: self.is_running(),
            jobs,
            active_queues,
            queued,
            connected_devices: self.shared.directory.connected_devices(),
        }
    }

    pub fn job_statistics(&self) -> JobStatistics {
        let state = self.shared.state.lock().expect("scheduler lock poisoned");
        let mut stats = JobStatistics::default();
        for record in state.jobs.values() {
            let job = &record.job;
            stats.by_role.entry(job.role).or_default().add(job.status);
            stats.by_priority.entry(job.priority).or_default().add(job.status);
        }
        stats
    }

    /// Per-device view: every directory device plus mapped devices the
    /// directory has lost.
    pub fn connection_status(&self) -> Vec<DeviceConnectionStatus> {
        let shared = &self.shared;
        let mut report: Vec<DeviceConnectionStatus> = shared
            .directory
            .list_devices()
            .into_iter()
            .map(|d| DeviceConnectionStatus {
                name: d.display_name().to_owned(),
                roles: shared.registry.roles_for(&d.id),
                status: Some(d.status),
                connected: d.connected,
                device_id: d.id,
                queued: 0,
                last_processed: None,
                consecutive_failures: 0,
                struggling: false,
                last_error: d.last_error,
            })
            .collect();

        for mapping in shared.registry.mappings() {
            if !report.iter().any(|r| r.device_id == mapping.device_id) {
                report.push(DeviceConnectionStatus {
                    roles: shared.registry.roles_for(&mapping.device_id),
                    device_id: mapping.device_id,
                    name: mapping.display_name,
                    status: None,
                    connected: false,
                    queued: 0,
                    last_processed: None,
                    consecutive_failures: 0,
                    struggling: false,
                    last_error: None,
                });
            }
        }

        let state = shared.state.lock().expect("scheduler lock poisoned");
        for entry in &mut report {
            if let Some(queue) = state.queues.get(&entry.device_id) {
                entry.queued = queue.len();
                entry.last_processed = queue.last_processed();
            }
            if let Some(health) = state.health.get(&entry.device_id) {
                entry.consecutive_failures = health.consecutive_failures;
                entry.struggling = health.is_struggling();
                if entry.last_error.is_none() {
                    entry.last_error = health.last_error.clone();
                }
            }
        }
        report
    }
}

fn cancel_locked(state: &mut SchedulerState, job_id: &JobId) -> Result<PrintJob> {
    let record = state
        .jobs
        .get_mut(job_id)
        .ok_or(BonwerkError::JobNotFound(*job_id))?;
    if record.job.status != JobStatus::Pending {
        return Err(BonwerkError::JobNotCancellable {
            id: *job_id,
            status: record.job.status,
        });
    }
    record.job.status = JobStatus::Cancelled;
    record.job.completed_at = Some(Utc::now());
    let job = record.job.clone();
    if let Some(queue) = state.queues.get_mut(&job.device_id) {
        queue.remove(job_id);
    }
    Ok(job)
}

/// Spawn the worker for a queue already marked `is_processing`.
fn launch_worker(shared: &Arc<SchedulerShared>, device_id: DeviceId) {
    // Spawn under the lock so the handle is registered before the worker
    // can retire; a finished handle from an earlier worker is replaced.
    let mut state = shared.state.lock().expect("scheduler lock poisoned");
    let worker = tokio::spawn(run_queue(Arc::clone(shared), device_id.clone()));
    state.workers.insert(device_id, worker);
}

/// Drain one device queue.
async fn run_queue(shared: Arc<SchedulerShared>, device_id: DeviceId) {
    debug!(device = %device_id, "queue worker started");
    loop {
        let permit = match shared.connections.acquire_exclusive().await {
            Ok(permit) => permit,
            Err(e) => {
                error!(error = %e, "transport region closed");
                shared.park_queue(&device_id);
                break;
            }
        };

        let Some(job) = shared.take_next(&device_id) else {
            break;
        };

        info!(job_id = %job.id, role = %job.role, device = %device_id, "printing");
        shared.log(&job, JobAction::Started, None);
        shared.events.emit(PrintEvent::job(EventKind::JobStarted, &job));

        let outcome = shared.execute(&job).await;
        shared.finish(&job.id, outcome);
        drop(permit);
    }
    debug!(device = %device_id, "queue worker idle");
}

impl SchedulerShared {
    /// Pop the head job and mark it printing, or retire the worker when the
    /// queue is empty or the scheduler stopped.
    fn take_next(&self, device_id: &DeviceId) -> Option<PrintJob> {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        let running = self.running.load(Ordering::SeqCst);
        let state = &mut *state;
        let queue = state.queues.entry(device_id.clone()).or_default();

        if !running {
            queue.is_processing = false;
            return None;
        }
        let next = loop {
            let Some(entry) = queue.pop() else {
                queue.is_processing = false;
                break None;
            };
            let Some(record) = state.jobs.get_mut(&entry.job_id) else {
                warn!(job_id = %entry.job_id, "queued job has no record, skipped");
                continue;
            };
            queue.last_processed = Some(Utc::now());
            record.job.status = JobStatus::Printing;
            record.job.started_at = Some(Utc::now());
            break Some(record.job.clone());
        };
        self.connections.set_backlog(state.backlog());
        next
    }

    /// Publish the queued total and apply the finished-job retention cap.
    fn settle_locked(&self, state: &mut SchedulerState) {
        self.connections.set_backlog(state.backlog());
        let pruned = state.prune_finished(self.config.max_finished_jobs);
        if pruned > 0 {
            debug!(pruned, "finished jobs dropped from memory");
        }
    }

    fn park_queue(&self, device_id: &DeviceId) {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        if let Some(queue) = state.queues.get_mut(device_id) {
            queue.is_processing = false;
        }
    }

    /// Connect-through-transmit for one job. Caller holds the permit.
    async fn execute(&self, job: &PrintJob) -> Result<()> {
        let target = &job.device_id;
        let name = match self.directory.lookup(target) {
            Ok(device) => device.display_name().to_owned(),
            Err(_) => self
                .registry
                .get_mapping(job.role)
                .map(|m| m.display_name)
                .unwrap_or_else(|| target.to_string()),
        };

        self.connections.release_link().await;
        tokio::time::sleep(self.config.settle_delay()).await;

        if let Err(first) = self.connections.connect(target).await {
            warn!(job_id = %job.id, device = %target, error = %first, "connect failed, retrying");
            tokio::time::sleep(self.config.connect_retry_delay()).await;
            if let Err(second) = self.connections.connect(target).await {
                warn!(job_id = %job.id, device = %target, error = %second, "second connect failed, reconnecting");
                self.connections.reconnect(target, &name).await?;
            }
        }

        let bytes = encode_for_role(self.encoder.as_ref(), job.role, &job.payload)?;
        self.connections.transport().transmit(&bytes).await?;
        debug!(job_id = %job.id, bytes = bytes.len(), "transmitted");
        Ok(())
    }

    /// Record the outcome of an attempt, re-queue or finalise, then notify.
    fn finish(&self, job_id: &JobId, outcome: Result<()>) {
        let (job, finish) = {
            let mut state = self.state.lock().expect("scheduler lock poisoned");
            let state = &mut *state;
            let Some(record) = state.jobs.get_mut(job_id) else {
                return;
            };
            let job = &mut record.job;

            let finish = match outcome {
                Ok(()) => {
                    job.status = JobStatus::Completed;
                    job.completed_at = Some(Utc::now());
                    job.last_error = None;
                    state.health.record_success(&job.device_id);
                    Finish::Completed
                }
                Err(e) => {
                    let error = e.to_string();
                    job.status = JobStatus::Failed;
                    job.retry_count += 1;
                    job.last_error = Some(error.clone());
                    state.health.record_failure(&job.device_id, &error);

                    if job.retry_count < job.max_retries {
                        job.status = JobStatus::Pending;
                        state
                            .queues
                            .entry(job.device_id.clone())
                            .or_default()
                            .push(QueueEntry {
                                job_id: job.id,
                                priority: job.priority,
                                seq: record.seq,
                            });
                        Finish::Retry {
                            attempt: job.retry_count,
                            error,
                        }
                    } else {
                        job.completed_at = Some(Utc::now());
                        Finish::Failed { error }
                    }
                }
            };
            let job = job.clone();
            self.settle_locked(state);
            (job, finish)
        };

        match finish {
            Finish::Completed => {
                info!(job_id = %job.id, device = %job.device_id, "job completed");
                self.log(&job, JobAction::Completed, None);
                self.events.emit(PrintEvent::job(EventKind::JobCompleted, &job));
            }
            Finish::Retry { attempt, error } => {
                warn!(
                    job_id = %job.id,
                    attempt,
                    max = job.max_retries,
                    error = %error,
                    "print attempt failed, re-queued"
                );
                self.log(&job, JobAction::Retry, Some(&error));
                self.events.emit(
                    PrintEvent::job(EventKind::QueueUpdated, &job)
                        .with_message(format!("retry {attempt}/{}: {error}", job.max_retries)),
                );
            }
            Finish::Failed { error } => {
                error!(job_id = %job.id, device = %job.device_id, error = %error, "job failed");
                self.log(&job, JobAction::Failed, Some(&error));
                self.events
                    .emit(PrintEvent::job(EventKind::JobFailed, &job).with_message(error));
            }
        }
    }

    /// Best-effort job log write.
    fn log(&self, job: &PrintJob, action: JobAction, details: Option<&str>) {
        if let Some(log) = &self.job_log {
            if let Err(e) = log.record(job, action, details) {
                warn!(job_id = %job.id, error = %e, "job log write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bonwerk_core::types::DeviceKind;
    use bonwerk_store::MemoryStore;
    use tokio::sync::broadcast;

    use crate::encoding::PassthroughEncoder;
    use crate::saved::SavedDeviceStore;
    use crate::scanner::StaticScanner;
    use crate::transport::MemoryTransport;

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            settle_delay_ms: 1,
            connect_retry_delay_ms: 1,
            ..OrchestratorConfig::default()
        }
    }

    struct Rig {
        transport: Arc<MemoryTransport>,
        directory: Arc<DeviceDirectory>,
        registry: Arc<RoleRegistry>,
        scheduler: JobScheduler,
        events: EventBus,
        log: Arc<JobLog>,
    }

    fn rig_with(transport: MemoryTransport) -> Rig {
        rig_config(fast_config(), transport)
    }

    fn rig_config(config: OrchestratorConfig, transport: MemoryTransport) -> Rig {
        let events = EventBus::new(1024);
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(transport);
        let directory = Arc::new(DeviceDirectory::new(
            Arc::new(StaticScanner::default()),
            events.clone(),
            Duration::from_millis(1),
        ));
        let saved = Arc::new(SavedDeviceStore::new(store.clone(), 3));
        let registry = Arc::new(RoleRegistry::load(store, saved.clone()));
        let connections = Arc::new(ConnectionManager::new(
            transport.clone(),
            directory.clone(),
            saved,
        ));
        let log = Arc::new(JobLog::open_in_memory().unwrap());
        let scheduler = JobScheduler::new(
            config,
            registry.clone(),
            directory.clone(),
            connections,
            Arc::new(PassthroughEncoder),
            events.clone(),
            Some(log.clone()),
        );
        Rig {
            transport,
            directory,
            registry,
            scheduler,
            events,
            log,
        }
    }

    fn rig() -> Rig {
        rig_with(MemoryTransport::new())
    }

    impl Rig {
        fn map(&self, role: Role, addr: &str) -> DeviceId {
            let device = self.directory.register_manually(addr, addr, DeviceKind::Network);
            self.registry.set_mapping(role, &device, true).unwrap();
            device.id
        }
    }

    fn raw(text: &str) -> PrintPayload {
        PrintPayload::Raw(text.as_bytes().to_vec())
    }

    async fn wait_terminal(scheduler: &JobScheduler, ids: &[JobId]) {
        for _ in 0..1000 {
            if ids
                .iter()
                .all(|id| scheduler.job(id).is_some_and(|j| j.is_terminal()))
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("jobs did not finish");
    }

    #[test]
    fn device_queue_orders_by_priority_then_seq() {
        let mut queue = DeviceQueue::new();
        let ids: Vec<JobId> = (0..5).map(|_| JobId::new()).collect();
        let plan = [
            (JobPriority::Normal, 0),
            (JobPriority::Low, 1),
            (JobPriority::High, 2),
            (JobPriority::Normal, 3),
            (JobPriority::High, 4),
        ];
        for (i, (priority, seq)) in plan.iter().enumerate() {
            queue.push(QueueEntry {
                job_id: ids[i],
                priority: *priority,
                seq: *seq,
            });
        }
        // A retried job re-enters with its old seq and goes ahead of seq 3.
        queue.remove(&ids[0]);
        queue.push(QueueEntry {
            job_id: ids[0],
            priority: JobPriority::Normal,
            seq: 0,
        });

        assert_eq!(
            queue.job_ids(),
            vec![ids[2], ids[4], ids[0], ids[3], ids[1]]
        );
        assert_eq!(queue.pop().map(|e| e.job_id), Some(ids[2]));
        assert_eq!(queue.len(), 4);
    }

    #[tokio::test]
    async fn submit_without_mapping_is_rejected() {
        let rig = rig();
        rig.scheduler.start();

        let err = rig
            .scheduler
            .submit(Role::Receipt, raw("x"), JobPriority::Normal)
            .unwrap_err();
        assert!(matches!(err, BonwerkError::NoMapping(Role::Receipt)));
        assert!(err.is_routing());
        assert!(rig.scheduler.jobs().is_empty());
        assert_eq!(rig.scheduler.status().queued, 0);
    }

    #[tokio::test]
    async fn submit_to_forgotten_device_is_rejected() {
        let rig = rig();
        rig.scheduler.start();
        let id = rig.map(Role::BarOrder, "10.0.0.2");
        rig.directory.forget(&id).unwrap();

        assert!(matches!(
            rig.scheduler.submit(Role::BarOrder, raw("x"), JobPriority::Normal),
            Err(BonwerkError::UnknownDevice { role: Role::BarOrder, .. })
        ));
        assert_eq!(rig.scheduler.queue_len(&id), 0);
    }

    #[tokio::test]
    async fn disabled_mapping_and_stopped_scheduler_reject() {
        let rig = rig();
        rig.map(Role::Receipt, "10.0.0.3");

        assert!(matches!(
            rig.scheduler.submit(Role::Receipt, raw("x"), JobPriority::Normal),
            Err(BonwerkError::SchedulerStopped)
        ));

        rig.scheduler.start();
        rig.registry.set_enabled(Role::Receipt, false).unwrap();
        assert!(matches!(
            rig.scheduler.submit(Role::Receipt, raw("x"), JobPriority::Normal),
            Err(BonwerkError::MappingDisabled(Role::Receipt))
        ));
    }

    #[tokio::test]
    async fn job_completes_and_is_logged() {
        let rig = rig();
        rig.scheduler.start();
        let device = rig.map(Role::KitchenOrder, "10.0.0.1");
        let mut rx = rig.events.subscribe();

        let id = rig
            .scheduler
            .submit(Role::KitchenOrder, raw("2x Schnitzel"), JobPriority::Normal)
            .unwrap();
        wait_terminal(&rig.scheduler, &[id]).await;

        let job = rig.scheduler.job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.started_at.is_some() && job.completed_at.is_some());
        assert_eq!(
            rig.transport.transmissions(),
            vec![(device.clone(), b"2x Schnitzel".to_vec())]
        );
        assert!(rig.directory.lookup(&device).unwrap().connected);

        let mut kinds = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if ev.job_id == Some(id) {
                kinds.push(ev.kind);
            }
        }
        assert_eq!(
            kinds,
            vec![EventKind::QueueUpdated, EventKind::JobStarted, EventKind::JobCompleted]
        );

        let history: Vec<String> = rig
            .log
            .history(&id)
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(history, vec!["submitted", "started", "completed"]);
    }

    #[tokio::test]
    async fn same_device_jobs_run_by_priority_then_fifo() {
        let rig = rig();
        let device = rig.map(Role::KitchenOrder, "10.0.0.1");
        rig.scheduler.start();

        // Hold the transport so everything queues up first.
        let permit = rig.scheduler.shared.connections.acquire_exclusive().await.unwrap();
        let plan = [
            ("n1", JobPriority::Normal),
            ("l1", JobPriority::Low),
            ("h1", JobPriority::High),
            ("n2", JobPriority::Normal),
            ("h2", JobPriority::High),
        ];
        let ids: Vec<JobId> = plan
            .iter()
            .map(|(text, p)| rig.scheduler.submit(Role::KitchenOrder, raw(text), *p).unwrap())
            .collect();
        assert_eq!(rig.scheduler.queue_len(&device), 5);
        drop(permit);

        wait_terminal(&rig.scheduler, &ids).await;
        let order: Vec<Vec<u8>> = rig
            .transport
            .transmissions()
            .into_iter()
            .map(|(_, bytes)| bytes)
            .collect();
        let expected: Vec<Vec<u8>> = ["h1", "h2", "n1", "n2", "l1"]
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect();
        assert_eq!(order, expected);
    }

    #[tokio::test]
    async fn one_transmission_at_a_time_across_devices() {
        let rig = rig_with(MemoryTransport::with_transmit_delay(Duration::from_millis(3)));
        rig.map(Role::KitchenOrder, "10.0.0.1");
        rig.map(Role::BarOrder, "10.0.0.2");
        rig.map(Role::Receipt, "10.0.0.3");
        rig.scheduler.start();

        let mut rx = rig.events.subscribe();
        let mut ids = Vec::new();
        for i in 0..4 {
            for role in Role::ALL {
                ids.push(
                    rig.scheduler
                        .submit(role, raw(&format!("{role}-{i}")), JobPriority::Normal)
                        .unwrap(),
                );
            }
        }
        wait_terminal(&rig.scheduler, &ids).await;

        assert_eq!(rig.transport.max_concurrent_transmissions(), 1);
        assert_eq!(rig.transport.transmissions().len(), 12);

        // Started/finished events never interleave.
        let mut printing = 0i32;
        loop {
            match rx.try_recv() {
                Ok(ev) => match ev.kind {
                    EventKind::JobStarted => {
                        printing += 1;
                        assert_eq!(printing, 1, "two jobs printing at once");
                    }
                    EventKind::JobCompleted | EventKind::JobFailed => printing -= 1,
                    _ => {}
                },
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(e) => panic!("event stream broken: {e}"),
            }
        }
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let rig = rig();
        rig.map(Role::Receipt, "10.0.0.3");
        rig.scheduler.start();
        rig.transport.fail_next_transmits(1);

        let id = rig
            .scheduler
            .submit(Role::Receipt, raw("bill"), JobPriority::Normal)
            .unwrap();
        wait_terminal(&rig.scheduler, &[id]).await;

        let job = rig.scheduler.job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 1);
        let history: Vec<String> = rig
            .log
            .history(&id)
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            history,
            vec!["submitted", "started", "retry", "started", "completed"]
        );
    }

    #[tokio::test]
    async fn connect_choreography_escalates_to_reconnect() {
        let rig = rig();
        rig.map(Role::Receipt, "10.0.0.3");
        rig.scheduler.start();
        // Plain connect twice, then the assisted reconnect succeeds.
        rig.transport.fail_next_connects(2);

        let id = rig
            .scheduler
            .submit(Role::Receipt, raw("bill"), JobPriority::Normal)
            .unwrap();
        wait_terminal(&rig.scheduler, &[id]).await;

        let job = rig.scheduler.job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 0);
        assert_eq!(rig.transport.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn exhausted_job_fails_terminally() {
        let rig = rig();
        let device = rig.map(Role::BarOrder, "10.0.0.2");
        rig.transport.set_unreachable(&device, true);
        rig.scheduler.start();
        let mut rx = rig.events.subscribe();

        let id = rig
            .scheduler
            .submit(Role::BarOrder, raw("3x Pils"), JobPriority::High)
            .unwrap();
        wait_terminal(&rig.scheduler, &[id]).await;

        let job = rig.scheduler.job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, job.max_retries);
        assert!(job.last_error.unwrap().contains("unreachable"));
        assert_eq!(rig.scheduler.queue_len(&device), 0);

        let mut started = 0;
        let mut failed = 0;
        while let Ok(ev) = rx.try_recv() {
            match ev.kind {
                EventKind::JobStarted => started += 1,
                EventKind::JobFailed => failed += 1,
                _ => {}
            }
        }
        assert_eq!(started, 3);
        assert_eq!(failed, 1);

        let report = rig.scheduler.connection_status();
        let entry = report.iter().find(|r| r.device_id == device).unwrap();
        assert_eq!(entry.consecutive_failures, 3);
        assert!(entry.struggling);
        assert_eq!(entry.roles, vec![Role::BarOrder]);
    }

    #[tokio::test]
    async fn cancel_only_while_pending() {
        let rig = rig();
        let device = rig.map(Role::KitchenOrder, "10.0.0.1");
        rig.scheduler.start();
        let mut rx = rig.events.subscribe();

        let permit = rig.scheduler.shared.connections.acquire_exclusive().await.unwrap();
        let first = rig
            .scheduler
            .submit(Role::KitchenOrder, raw("a"), JobPriority::Normal)
            .unwrap();
        let second = rig
            .scheduler
            .submit(Role::KitchenOrder, raw("b"), JobPriority::Normal)
            .unwrap();

        rig.scheduler.cancel(&second).unwrap();
        assert_eq!(rig.scheduler.job(&second).unwrap().status, JobStatus::Cancelled);
        assert_eq!(rig.scheduler.queue_snapshot(&device), vec![first]);
        assert!(matches!(
            rig.scheduler.cancel(&second),
            Err(BonwerkError::JobNotCancellable { .. })
        ));
        assert!(matches!(
            rig.scheduler.cancel(&JobId::new()),
            Err(BonwerkError::JobNotFound(_))
        ));

        drop(permit);
        wait_terminal(&rig.scheduler, &[first]).await;

        let started: Vec<Option<JobId>> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|ev| ev.kind == EventKind::JobStarted)
            .map(|ev| ev.job_id)
            .collect();
        assert_eq!(started, vec![Some(first)], "cancelled job must never print");
    }

    #[tokio::test]
    async fn cancel_while_printing_is_rejected() {
        let slow = rig_with(MemoryTransport::with_transmit_delay(Duration::from_millis(200)));
        slow.map(Role::Receipt, "10.0.0.3");
        slow.scheduler.start();
        let busy = slow
            .scheduler
            .submit(Role::Receipt, raw("long"), JobPriority::Normal)
            .unwrap();
        for _ in 0..500 {
            if slow.scheduler.job(&busy).unwrap().status == JobStatus::Printing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(matches!(
            slow.scheduler.cancel(&busy),
            Err(BonwerkError::JobNotCancellable {
                status: JobStatus::Printing,
                ..
            })
        ));
        wait_terminal(&slow.scheduler, &[busy]).await;
    }

    #[tokio::test]
    async fn print_for_order_has_no_cross_role_transaction() {
        let rig = rig();
        rig.map(Role::KitchenOrder, "10.0.0.1");
        rig.scheduler.start();

        let results = rig.scheduler.print_for_order(vec![
            PrintRequest {
                role: Role::KitchenOrder,
                payload: raw("food"),
                priority: JobPriority::High,
            },
            PrintRequest {
                role: Role::BarOrder,
                payload: raw("drinks"),
                priority: JobPriority::High,
            },
        ]);

        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(BonwerkError::NoMapping(Role::BarOrder))));
        let ok: Vec<JobId> = results.into_iter().filter_map(|r| r.ok()).collect();
        wait_terminal(&rig.scheduler, &ok).await;
    }

    #[tokio::test]
    async fn stop_keeps_pending_jobs_for_restart() {
        let rig = rig();
        let device = rig.map(Role::KitchenOrder, "10.0.0.1");
        rig.scheduler.start();

        let permit = rig.scheduler.shared.connections.acquire_exclusive().await.unwrap();
        let ids: Vec<JobId> = (0..3)
            .map(|i| {
                rig.scheduler
                    .submit(Role::KitchenOrder, raw(&i.to_string()), JobPriority::Normal)
                    .unwrap()
            })
            .collect();

        let stopping = {
            let scheduler = &rig.scheduler;
            async move { scheduler.stop().await }
        };
        drop(permit);
        stopping.await;

        assert!(!rig.scheduler.is_running());
        assert_eq!(rig.scheduler.queue_len(&device), 3);
        assert!(rig.transport.transmissions().is_empty());

        rig.scheduler.start();
        wait_terminal(&rig.scheduler, &ids).await;
        assert_eq!(rig.transport.transmissions().len(), 3);
    }

    #[tokio::test]
    async fn statistics_and_cleanup() {
        let rig = rig();
        let device = rig.map(Role::KitchenOrder, "10.0.0.1");
        rig.map(Role::Receipt, "10.0.0.3");
        rig.scheduler.start();

        let a = rig
            .scheduler
            .submit(Role::KitchenOrder, raw("a"), JobPriority::High)
            .unwrap();
        let b = rig
            .scheduler
            .submit(Role::Receipt, raw("b"), JobPriority::Low)
            .unwrap();
        wait_terminal(&rig.scheduler, &[a, b]).await;

        let stats = rig.scheduler.job_statistics();
        assert_eq!(stats.by_role[&Role::KitchenOrder].completed, 1);
        assert_eq!(stats.by_priority[&JobPriority::Low].total, 1);

        let status = rig.scheduler.status();
        assert!(status.running);
        assert_eq!(status.jobs.completed, 2);
        assert_eq!(status.queued, 0);

        assert_eq!(rig.scheduler.clear_finished(), 2);
        assert!(rig.scheduler.jobs().is_empty());
        assert!(rig.scheduler.clear_queue(&device).is_empty());
    }

    #[tokio::test]
    async fn finished_jobs_are_pruned_past_cap() {
        let rig = rig_config(
            OrchestratorConfig {
                max_finished_jobs: 2,
                ..fast_config()
            },
            MemoryTransport::new(),
        );
        rig.map(Role::KitchenOrder, "10.0.0.1");
        rig.scheduler.start();

        let ids: Vec<JobId> = (0..5)
            .map(|i| {
                rig.scheduler
                    .submit(Role::KitchenOrder, raw(&i.to_string()), JobPriority::Normal)
                    .unwrap()
            })
            .collect();
        // Submitted, started and completed rows for every job.
        for _ in 0..1000 {
            if rig.log.count().unwrap() == 15 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(rig.transport.transmissions().len(), 5);

        let kept: Vec<JobId> = rig.scheduler.jobs().iter().map(|j| j.id).collect();
        assert_eq!(kept, ids[3..].to_vec());
        assert!(rig.scheduler.job(&ids[0]).is_none());
        assert_eq!(rig.log.count().unwrap(), 15);
    }

    #[tokio::test]
    async fn backlog_is_published_to_connections() {
        let rig = rig();
        rig.map(Role::KitchenOrder, "10.0.0.1");
        rig.scheduler.start();
        let connections = Arc::clone(&rig.scheduler.shared.connections);

        let permit = connections.acquire_exclusive().await.unwrap();
        let first = rig
            .scheduler
            .submit(Role::KitchenOrder, raw("a"), JobPriority::Normal)
            .unwrap();
        let second = rig
            .scheduler
            .submit(Role::KitchenOrder, raw("b"), JobPriority::Normal)
            .unwrap();
        assert_eq!(connections.backlog(), 2);

        rig.scheduler.cancel(&second).unwrap();
        assert_eq!(connections.backlog(), 1);
        assert!(!connections.is_idle());

        drop(permit);
        wait_terminal(&rig.scheduler, &[first]).await;
        assert_eq!(connections.backlog(), 0);
    }

    #[tokio::test]
    async fn clear_queue_cancels_pending_only() {
        let rig = rig();
        let device = rig.map(Role::KitchenOrder, "10.0.0.1");
        rig.scheduler.start();

        let permit = rig.scheduler.shared.connections.acquire_exclusive().await.unwrap();
        let ids: Vec<JobId> = (0..3)
            .map(|i| {
                rig.scheduler
                    .submit(Role::KitchenOrder, raw(&i.to_string()), JobPriority::Normal)
                    .unwrap()
            })
            .collect();
        let cleared = rig.scheduler.clear_queue(&device);
        drop(permit);

        assert_eq!(cleared, ids);
        assert_eq!(rig.scheduler.queue_len(&device), 0);
        assert_eq!(rig.scheduler.status().jobs.cancelled, 3);
        assert_eq!(rig.log.count().unwrap(), 6);
    }
}
