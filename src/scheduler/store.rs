use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum::AsRefStr;

use super::{JobDescriptor, MisfirePolicy, Trigger};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Waiting,
    Executing,
    /// Retries exhausted; only `execute_again` or a reschedule revives it.
    Error,
}

/// A job descriptor with its trigger and firing bookkeeping.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduledJob {
    pub descriptor: JobDescriptor,
    pub trigger: Trigger,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub state: JobState,
    /// Executions in flight.
    pub running: u32,
    /// Consecutive failures of the current firing.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub paused: bool,
    /// A trigger fired while a non-concurrent execution was running.
    pub refire: bool,
}

impl ScheduledJob {
    pub fn new(
        descriptor: JobDescriptor,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let next_fire_time = trigger.first_fire_time(now)?;
        Ok(Self {
            descriptor,
            trigger,
            next_fire_time,
            state: JobState::Waiting,
            running: 0,
            attempts: 0,
            last_error: None,
            paused: false,
            refire: false,
        })
    }

    pub fn key(&self) -> (String, String) {
        (self.descriptor.group_name.clone(), self.descriptor.job_name.clone())
    }

    fn is_due(
        &self,
        now: DateTime<Utc>,
    ) -> bool {
        !self.paused && self.state != JobState::Error && self.next_fire_time.is_some_and(|t| t <= now)
    }

    /// Consumes a due fire time. Returns the fire time when an execution must start.
    fn fire(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let Some(fire_time) = self.next_fire_time else {
            return Ok(None);
        };
        self.next_fire_time = if self.attempts > 0 {
            None
        } else {
            self.trigger.next_fire_time(fire_time.max(now))?
        };
        if self.running > 0 && self.descriptor.disallow_concurrent_execution {
            self.refire = true;
            return Ok(None);
        }
        self.running += 1;
        self.state = JobState::Executing;
        Ok(Some(fire_time))
    }

    /// Records a successful execution. Returns false when the job is finished for good.
    pub fn succeed(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.running = self.running.saturating_sub(1);
        if self.attempts > 0 {
            self.next_fire_time = self.trigger.next_fire_time(now)?;
        }
        self.attempts = 0;
        self.last_error = None;
        if self.refire {
            self.refire = false;
            self.next_fire_time = Some(now);
        }
        self.state = if self.running > 0 {
            JobState::Executing
        } else {
            JobState::Waiting
        };
        Ok(self.running > 0 || self.next_fire_time.is_some())
    }

    /// Records a failed execution and schedules a retry while retries remain.
    pub fn fail(
        &mut self,
        now: DateTime<Utc>,
        error: &str,
        max_retries: u32,
        retry_delay: chrono::Duration,
    ) {
        self.running = self.running.saturating_sub(1);
        if self.refire {
            // a newer firing superseded the one that failed
            self.refire = false;
            self.attempts = 0;
            self.last_error = Some(error.to_string());
            self.next_fire_time = Some(now);
            self.state = if self.running > 0 {
                JobState::Executing
            } else {
                JobState::Waiting
            };
            return;
        }
        self.attempts += 1;
        self.last_error = Some(error.to_string());
        if self.attempts <= max_retries {
            self.next_fire_time = Some(now + retry_delay);
            self.state = if self.running > 0 {
                JobState::Executing
            } else {
                JobState::Waiting
            };
        } else {
            self.state = JobState::Error;
        }
    }

    /// Makes the job fire at `now` with a clean retry budget.
    pub fn reset(
        &mut self,
        now: DateTime<Utc>,
    ) {
        self.state = JobState::Waiting;
        self.attempts = 0;
        self.last_error = None;
        self.next_fire_time = Some(now);
    }

    /// Handles a fire time that passed while no scheduler ran. Returns true when changed.
    pub fn recover_misfire(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        // executions in flight belong to a previous scheduler
        if self.running > 0 {
            self.running = 0;
            self.refire = false;
            self.reset(now);
            return Ok(true);
        }
        if self.state == JobState::Error {
            self.reset(now);
            return Ok(true);
        }
        match self.next_fire_time {
            Some(t) if t < now => {
                match (self.trigger.misfire(), self.trigger.is_one_shot()) {
                    (MisfirePolicy::Skip, false) => self.next_fire_time = self.trigger.next_fire_time(now)?,
                    _ => self.next_fire_time = Some(now),
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Durable storage of scheduled jobs. It may outlive the scheduler that uses it.
pub trait JobStore: Send + Sync {
    fn next_id(&self) -> u64;

    /// Inserts or replaces the job with the same group and name.
    fn put(
        &self,
        job: ScheduledJob,
    ) -> Result<()>;

    fn get(
        &self,
        group_name: &str,
        job_name: &str,
    ) -> Result<Option<ScheduledJob>>;

    fn remove(
        &self,
        group_name: &str,
        job_name: &str,
    ) -> Result<Option<ScheduledJob>>;

    /// Jobs of a group, or every job.
    fn list(
        &self,
        group_name: Option<&str>,
    ) -> Result<Vec<ScheduledJob>>;

    /// Applies `f` to one job and returns it. `f` returns false to remove the job, and
    /// `None` is returned when the job is gone.
    fn update(
        &self,
        group_name: &str,
        job_name: &str,
        f: &mut dyn FnMut(&mut ScheduledJob) -> Result<bool>,
    ) -> Result<Option<ScheduledJob>>;

    /// Applies `f` to every job of a group (or all jobs). Returns how many it changed.
    fn update_all(
        &self,
        group_name: Option<&str>,
        f: &mut dyn FnMut(&mut ScheduledJob) -> Result<bool>,
    ) -> Result<usize>;

    /// Atomically consumes due fire times and returns the executions to start.
    fn acquire_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<(ScheduledJob, DateTime<Utc>)>>;

    /// Earliest pending fire time.
    fn next_fire_time(&self) -> Result<Option<DateTime<Utc>>>;

    fn set_group_paused(
        &self,
        group_name: &str,
        paused: bool,
    ) -> Result<()>;

    fn is_group_paused(
        &self,
        group_name: &str,
    ) -> Result<bool>;
}

#[derive(Default)]
struct MemJobs {
    jobs: BTreeMap<(String, String), ScheduledJob>,
    paused_groups: HashSet<String>,
    next_id: u64,
}

#[derive(Default)]
pub struct MemJobStore {
    inner: Mutex<MemJobs>,
}

impl MemJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemJobStore {
    fn next_id(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        inner.next_id
    }

    fn put(
        &self,
        mut job: ScheduledJob,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.paused_groups.contains(&job.descriptor.group_name) {
            job.paused = true;
        }
        if let Some(current) = inner.jobs.get(&job.key()) {
            // executions in flight still count against the replacement
            job.running = current.running;
            if job.running > 0 {
                job.state = JobState::Executing;
            }
        }
        inner.jobs.insert(job.key(), job);
        Ok(())
    }

    fn get(
        &self,
        group_name: &str,
        job_name: &str,
    ) -> Result<Option<ScheduledJob>> {
        Ok(self.inner.lock().jobs.get(&(group_name.to_string(), job_name.to_string())).cloned())
    }

    fn remove(
        &self,
        group_name: &str,
        job_name: &str,
    ) -> Result<Option<ScheduledJob>> {
        Ok(self.inner.lock().jobs.remove(&(group_name.to_string(), job_name.to_string())))
    }

    fn list(
        &self,
        group_name: Option<&str>,
    ) -> Result<Vec<ScheduledJob>> {
        let inner = self.inner.lock();
        Ok(inner.jobs.values().filter(|j| group_name.is_none_or(|g| j.descriptor.group_name == g)).cloned().collect())
    }

    fn update(
        &self,
        group_name: &str,
        job_name: &str,
        f: &mut dyn FnMut(&mut ScheduledJob) -> Result<bool>,
    ) -> Result<Option<ScheduledJob>> {
        let mut inner = self.inner.lock();
        let key = (group_name.to_string(), job_name.to_string());
        let Some(job) = inner.jobs.get_mut(&key) else {
            return Ok(None);
        };
        if f(job)? {
            return Ok(Some(job.clone()));
        }
        inner.jobs.remove(&key);
        Ok(None)
    }

    fn update_all(
        &self,
        group_name: Option<&str>,
        f: &mut dyn FnMut(&mut ScheduledJob) -> Result<bool>,
    ) -> Result<usize> {
        let mut inner = self.inner.lock();
        let mut changed = 0;
        for job in inner.jobs.values_mut() {
            if group_name.is_none_or(|g| job.descriptor.group_name == g) && f(job)? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn acquire_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<(ScheduledJob, DateTime<Utc>)>> {
        let mut inner = self.inner.lock();
        let mut due: Vec<&mut ScheduledJob> = inner.jobs.values_mut().filter(|j| j.is_due(now)).collect();
        due.sort_by_key(|j| j.next_fire_time);

        let mut firings = Vec::new();
        for job in due.into_iter() {
            if firings.len() >= limit {
                break;
            }
            if let Some(fire_time) = job.fire(now)? {
                firings.push((job.clone(), fire_time));
            }
        }
        Ok(firings)
    }

    fn next_fire_time(&self) -> Result<Option<DateTime<Utc>>> {
        let inner = self.inner.lock();
        Ok(inner.jobs.values().filter(|j| !j.paused && j.state != JobState::Error).filter_map(|j| j.next_fire_time).min())
    }

    fn set_group_paused(
        &self,
        group_name: &str,
        paused: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if paused {
            inner.paused_groups.insert(group_name.to_string());
        } else {
            inner.paused_groups.remove(group_name);
        }
        for job in inner.jobs.values_mut().filter(|j| j.descriptor.group_name == group_name) {
            job.paused = paused;
        }
        Ok(())
    }

    fn is_group_paused(
        &self,
        group_name: &str,
    ) -> Result<bool> {
        Ok(self.inner.lock().paused_groups.contains(group_name))
    }
}
