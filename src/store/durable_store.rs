//! The persistence interface the kernel depends on, independent of the
//! concrete storage engine (spec §4.4).

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::job::Job;
use crate::scheduler::Schedule;
use crate::webhook::Webhook;

/// State that must survive a process restart: schedules (so
/// `next_run`/`last_run` aren't lost), in-flight/terminal jobs (for
/// `query`/audit after a crash), and webhook subscriptions.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn save_schedule(&self, schedule: &Schedule) -> Result<()>;
    async fn load_schedules(&self) -> Result<Vec<Schedule>>;
    async fn delete_schedule(&self, id: Uuid) -> Result<()>;

    async fn save_webhook(&self, webhook: &Webhook) -> Result<()>;
    async fn load_webhooks(&self) -> Result<Vec<Webhook>>;
    async fn delete_webhook(&self, id: Uuid) -> Result<()>;

    async fn save_job(&self, job: &Job) -> Result<()>;
    async fn load_jobs(&self) -> Result<Vec<Job>>;
}
