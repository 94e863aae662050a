use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use parking_lot::{Condvar, Mutex, RwLock};
use tokio::{runtime::Handle, sync::Notify};
use tracing::{debug, error, info, warn};

use super::{JobContext, JobDescriptor, JobEnvironment, JobState, JobStore, ScheduledJob, Trigger};
use crate::{ProcflowError, Result, SchedulerConfig, common::Shutdown, transaction::TransactionService, utils};

pub struct SchedulerService {
    store: Arc<dyn JobStore>,
    txs: Arc<TransactionService>,
    config: SchedulerConfig,
    wakeup: Arc<Notify>,
    shutdown: Arc<Shutdown>,
    running: Mutex<usize>,
    idle: Condvar,
    environment: RwLock<Option<Arc<dyn JobEnvironment>>>,
    handle: Handle,
}

impl SchedulerService {
    pub fn new(
        store: Arc<dyn JobStore>,
        txs: Arc<TransactionService>,
        config: SchedulerConfig,
        handle: Handle,
    ) -> Self {
        Self {
            store,
            txs,
            config,
            wakeup: Arc::new(Notify::new()),
            shutdown: Arc::new(Shutdown::new()),
            running: Mutex::new(0),
            idle: Condvar::new(),
            environment: RwLock::new(None),
            handle,
        }
    }

    pub fn job_store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    /// Schedules `descriptor` with `trigger`, replacing a job with the same group and name.
    /// Inside a transaction the job is stored only once the transaction commits.
    pub fn schedule(
        &self,
        mut descriptor: JobDescriptor,
        trigger: Trigger,
    ) -> Result<()> {
        if descriptor.id == 0 {
            descriptor.id = self.store.next_id();
        }
        let job = ScheduledJob::new(descriptor, trigger, Utc::now())?;
        let store = self.store.clone();
        let wakeup = self.wakeup.clone();
        let apply = move || {
            debug!(job_name = %job.descriptor.job_name, group = %job.descriptor.group_name, next = ?job.next_fire_time, "job scheduled");
            if let Err(e) = store.put(job) {
                error!(error = %e, "failed to store scheduled job");
            }
            wakeup.notify_one();
        };
        if self.txs.is_transaction_active() {
            self.txs.register_after_commit(apply)
        } else {
            apply();
            Ok(())
        }
    }

    /// Schedules `descriptor` to run as soon as possible.
    pub fn execute_now(
        &self,
        descriptor: JobDescriptor,
    ) -> Result<()> {
        let trigger = Trigger::one_shot(&descriptor.job_name, Utc::now());
        self.schedule(descriptor, trigger)
    }

    /// Fires an existing job immediately with a fresh retry budget, bypassing its trigger.
    pub fn execute_again(
        &self,
        group_name: &str,
        job_name: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let updated = self.store.update(group_name, job_name, &mut |job| {
            job.reset(now);
            Ok(true)
        })?;
        if updated.is_none() {
            return Err(ProcflowError::Scheduler(format!("job {}/{} does not exist", group_name, job_name)));
        }
        self.wakeup.notify_one();
        Ok(())
    }

    pub fn pause_jobs(
        &self,
        group_name: &str,
    ) -> Result<()> {
        info!(group = group_name, "pausing jobs");
        self.store.set_group_paused(group_name, true)
    }

    pub fn resume_jobs(
        &self,
        group_name: &str,
    ) -> Result<()> {
        info!(group = group_name, "resuming jobs");
        self.store.set_group_paused(group_name, false)?;
        self.wakeup.notify_one();
        Ok(())
    }

    /// Repairs triggers left behind by a previous run: misfired fire times, executions
    /// interrupted mid-flight and jobs in the error state. Returns how many were changed.
    pub fn reschedule_erroneous_triggers(&self) -> Result<usize> {
        let now = Utc::now();
        let changed = self.store.update_all(None, &mut |job| job.recover_misfire(now))?;
        if changed > 0 {
            info!(changed, "rescheduled erroneous triggers");
            self.wakeup.notify_one();
        }
        Ok(changed)
    }

    pub fn is_existing_job(
        &self,
        group_name: &str,
        job_name: &str,
    ) -> Result<bool> {
        Ok(self.store.get(group_name, job_name)?.is_some())
    }

    pub fn get_jobs(
        &self,
        group_name: &str,
    ) -> Result<Vec<ScheduledJob>> {
        self.store.list(Some(group_name))
    }

    pub fn get_job(
        &self,
        group_name: &str,
        job_name: &str,
    ) -> Result<Option<ScheduledJob>> {
        self.store.get(group_name, job_name)
    }

    /// Deletes a job. Inside a transaction the deletion happens once it commits.
    pub fn delete_job(
        &self,
        group_name: &str,
        job_name: &str,
    ) -> Result<()> {
        let store = self.store.clone();
        let group = group_name.to_string();
        let name = job_name.to_string();
        let apply = move || match store.remove(&group, &name) {
            Ok(Some(_)) => debug!(job_name = %name, group = %group, "job deleted"),
            Ok(None) => {}
            Err(e) => error!(job_name = %name, group = %group, error = %e, "failed to delete job"),
        };
        if self.txs.is_transaction_active() {
            self.txs.register_after_commit(apply)
        } else {
            apply();
            Ok(())
        }
    }

    pub fn delete_jobs(
        &self,
        group_name: &str,
    ) -> Result<usize> {
        let jobs = self.store.list(Some(group_name))?;
        for job in jobs.iter() {
            self.store.remove(group_name, &job.descriptor.job_name)?;
        }
        Ok(jobs.len())
    }

    /// Jobs whose retries are exhausted.
    pub fn failed_jobs(
        &self,
        group_name: Option<&str>,
    ) -> Result<Vec<ScheduledJob>> {
        Ok(self.store.list(group_name)?.into_iter().filter(|j| j.state == JobState::Error).collect())
    }

    pub fn number_of_running_jobs(&self) -> usize {
        *self.running.lock()
    }

    fn run_finished(&self) {
        let mut running = self.running.lock();
        *running = running.saturating_sub(1);
        if *running == 0 {
            self.idle.notify_all();
        }
    }

    /// Starts the scheduler loop. Jobs receive `environment` in their context.
    pub fn start(
        self: &Arc<Self>,
        environment: Arc<dyn JobEnvironment>,
    ) {
        *self.environment.write() = Some(environment);
        let scheduler = self.clone();
        let shutdown = self.shutdown.clone();
        let wakeup = self.wakeup.clone();
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));

        self.handle.spawn(async move {
            info!("scheduler started");
            loop {
                if shutdown.is_terminated() {
                    break;
                }
                let sleep = match scheduler.fire_due() {
                    Ok(next) => next.map(|t| utils::time::until(Utc::now(), t).min(poll)).unwrap_or(poll),
                    Err(e) => {
                        error!(error = %e, "scheduler iteration failed");
                        poll
                    }
                };
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = wakeup.notified() => {}
                    _ = tokio::time::sleep(sleep) => {}
                }
            }
            info!("scheduler stopped");
        });
    }

    /// Stops the loop and waits up to `timeout` for running jobs.
    pub fn shutdown(
        &self,
        timeout: Duration,
    ) {
        self.shutdown.shutdown();
        let deadline = Instant::now() + timeout;
        let mut running = self.running.lock();
        while *running > 0 {
            if self.idle.wait_until(&mut running, deadline).timed_out() {
                break;
            }
        }
        if *running > 0 {
            warn!(running = *running, "scheduler stopped with jobs still running");
        }
        drop(running);
        self.environment.write().take();
    }

    fn fire_due(self: &Arc<Self>) -> Result<Option<chrono::DateTime<Utc>>> {
        let Some(environment) = self.environment.read().clone() else {
            return Ok(None);
        };
        let firings = self.store.acquire_due(Utc::now(), self.config.batch_size.max(1))?;
        for (job, fire_time) in firings {
            *self.running.lock() += 1;
            let scheduler = self.clone();
            let environment = environment.clone();
            self.handle.spawn_blocking(move || {
                scheduler.run(job, fire_time, environment);
                scheduler.run_finished();
            });
        }
        self.store.next_fire_time()
    }

    fn run(
        &self,
        job: ScheduledJob,
        fire_time: chrono::DateTime<Utc>,
        environment: Arc<dyn JobEnvironment>,
    ) {
        let group = job.descriptor.group_name.clone();
        let name = job.descriptor.job_name.clone();
        let max_retries = job.descriptor.max_retries.unwrap_or(self.config.max_job_retries);
        debug!(job_name = %name, group = %group, "executing job");

        let result = catch_unwind(AssertUnwindSafe(|| {
            let content = job.descriptor.content()?;
            let ctx = JobContext {
                descriptor: job.descriptor.clone(),
                fire_time,
                environment,
            };
            content.execute(&ctx)
        }))
        .unwrap_or_else(|_| Err(ProcflowError::Scheduler(format!("job {} panicked", name))));

        let now = Utc::now();
        let retry_delay = chrono::Duration::milliseconds(self.config.retry_delay_ms as i64);
        let outcome = match &result {
            Ok(()) => self.store.update(&group, &name, &mut |j| j.succeed(now)),
            Err(e) => {
                let message = e.to_string();
                self.store.update(&group, &name, &mut |j| {
                    j.fail(now, &message, max_retries, retry_delay);
                    Ok(true)
                })
            }
        };
        match (&result, outcome) {
            (Err(e), Ok(Some(j))) if j.state == JobState::Error => {
                error!(job_name = %name, group = %group, attempts = j.attempts, error = %e, "job failed, retries exhausted")
            }
            (Err(e), _) => warn!(job_name = %name, group = %group, error = %e, "job failed, will retry"),
            (Ok(()), Err(e)) => error!(job_name = %name, group = %group, error = %e, "failed to record job completion"),
            _ => debug!(job_name = %name, group = %group, "job completed"),
        }
        self.wakeup.notify_one();
    }
}
