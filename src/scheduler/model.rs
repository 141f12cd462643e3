//! Recurring export schedule model.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::job::{ExportPayload, JobPriority};

/// What advances a schedule's `next_run`: a cron expression, or a fixed
/// interval measured from the last fire (spec §3 data model).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Trigger {
    Cron(String),
    Interval(Duration),
}

/// A recurring job template, fired on a cron schedule or fixed interval
/// (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Schedule {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub name: String,
    pub trigger: Trigger,
    pub job_name: String,
    #[builder(default)]
    pub priority: JobPriority,
    pub payload: ExportPayload,
    #[builder(default = true)]
    pub enabled: bool,
    #[builder(default, setter(strip_option))]
    pub next_run: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_run: Option<DateTime<Utc>>,
}
