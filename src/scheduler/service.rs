//! Cron-driven scheduler: ticks, finds due schedules, submits a job for
//! each, and advances `next_run`.
//!
//! Catch-up semantics (spec §9 open question, resolved fire-once-and-
//! advance): `next_run` is always recomputed from "now" via the `cron`
//! crate's `upcoming(Utc)` iterator rather than from the stale prior
//! `next_run`, so any number of missed ticks (e.g. after a long pause)
//! collapse into exactly one catch-up fire instead of one per missed
//! occurrence. Grounded on the teacher's `scheduled_tasks.rs`, which
//! drives `tokio-cron-scheduler` from a similar tick loop.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::job::{JobManager, JobSubmission};

use super::model::{Schedule, Trigger};

pub struct Scheduler {
    schedules: RwLock<HashMap<Uuid, Schedule>>,
    manager: Arc<JobManager>,
    shutdown: CancellationToken,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(manager: Arc<JobManager>, tick_interval: Duration) -> Self {
        Self {
            schedules: RwLock::new(HashMap::new()),
            manager,
            shutdown: CancellationToken::new(),
            tick_interval,
        }
    }

    /// Validate the trigger, compute the first `next_run`, and store the
    /// schedule.
    pub async fn add_schedule(&self, mut schedule: Schedule) -> Result<Uuid> {
        schedule.next_run = Some(compute_next_run(&schedule.trigger, Utc::now())?);
        let id = schedule.id;
        self.schedules.write().await.insert(id, schedule);
        Ok(id)
    }

    pub async fn remove_schedule(&self, id: Uuid) -> bool {
        self.schedules.write().await.remove(&id).is_some()
    }

    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<()> {
        let mut schedules = self.schedules.write().await;
        let schedule = schedules
            .get_mut(&id)
            .ok_or_else(|| CoreError::Validation(format!("unknown schedule {id}")))?;
        schedule.enabled = enabled;
        Ok(())
    }

    pub async fn list(&self) -> Vec<Schedule> {
        self.schedules.read().await.values().cloned().collect()
    }

    pub async fn load(&self, schedules: Vec<Schedule>) {
        let mut table = self.schedules.write().await;
        for schedule in schedules {
            table.insert(schedule.id, schedule);
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Run the ticker loop until `stop()` is called. Safe to call at most
    /// once per scheduler instance.
    pub async fn run(self: Arc<Self>) {
        info!("scheduler started");
        let mut ticker = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick_once().await,
            }
        }
        info!("scheduler stopped");
    }

    async fn tick_once(&self) {
        let now = Utc::now();
        let due: Vec<Uuid> = self
            .schedules
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.enabled && s.next_run.map(|t| t <= now).unwrap_or(false))
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            self.fire(id, now).await;
        }
    }

    async fn fire(&self, id: Uuid, now: DateTime<Utc>) {
        let snapshot = {
            let schedules = self.schedules.read().await;
            schedules.get(&id).cloned()
        };
        let Some(schedule) = snapshot else { return };

        let submission = JobSubmission::builder()
            .name(schedule.job_name.clone())
            .priority(schedule.priority)
            .payload(schedule.payload.clone())
            .build();

        match self.manager.submit(submission).await {
            Ok(job) => info!(schedule_id = %id, job_id = %job.id, "schedule fired"),
            Err(e) => warn!(schedule_id = %id, error = %e, "scheduled submit failed"),
        }

        let next = compute_next_run(&schedule.trigger, now).ok();

        let mut schedules = self.schedules.write().await;
        if let Some(s) = schedules.get_mut(&id) {
            s.last_run = Some(now);
            s.next_run = next;
        }
    }
}

fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(expr).map_err(|e| CoreError::Validation(format!("invalid cron expression: {e}")))
}

/// Advances a trigger from `after`: the next cron occurrence, or
/// `after + interval` for a fixed-interval schedule (spec §4.7).
fn compute_next_run(trigger: &Trigger, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match trigger {
        Trigger::Cron(expr) => parse_cron(expr)?
            .upcoming(Utc)
            .next()
            .ok_or_else(|| CoreError::Validation(format!("cron expression {expr} has no future occurrence"))),
        Trigger::Interval(interval) => {
            let delta = chrono::Duration::from_std(*interval)
                .map_err(|e| CoreError::Validation(format!("interval out of range: {e}")))?;
            Ok(after + delta)
        }
    }
}
