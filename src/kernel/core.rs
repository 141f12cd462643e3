//! Dependency-injection root wiring every subsystem together.
//!
//! Grounded on the teacher's `ServerKernel` (`kernel/server_kernel.rs`):
//! a single struct holding `Arc<dyn Trait>`/`Arc<Concrete>` handles to
//! each service, constructed once at startup and handed down instead of
//! threaded through globals.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::change_tracker::ChangeTracker;
use crate::config::Config;
use crate::error::Result;
use crate::job::{spawn_workers, JobManager, ManagerConfig, NullListener};
use crate::provider::{CapabilityDetector, ProviderRegistry};
use crate::scheduler::{Schedule, Scheduler};
use crate::store::{DurableStore, SqliteStore};
use crate::webhook::{Webhook, WebhookNotifier};

pub struct HyperKernel {
    pub config: Config,
    pub registry: Arc<ProviderRegistry>,
    pub job_manager: Arc<JobManager>,
    pub scheduler: Arc<Scheduler>,
    pub webhook_notifier: Arc<WebhookNotifier>,
    pub store: Arc<dyn DurableStore>,
    pub change_tracker: Arc<ChangeTracker>,
    pub capability_detector: Arc<CapabilityDetector>,

    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    scheduler_handle: Mutex<Option<JoinHandle<()>>>,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
}

impl HyperKernel {
    /// Build every subsystem and load persisted schedules/webhooks so a
    /// restart picks up where it left off (spec §5 restart-durability
    /// guarantee). Does not start any background task; call `start()`.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::connect(&config.db_path).await?);
        let registry = Arc::new(ProviderRegistry::new());

        let webhook_notifier = Arc::new(WebhookNotifier::new(reqwest::Client::new()));
        for webhook in store.load_webhooks().await? {
            webhook_notifier.register(webhook).await;
        }

        let change_tracker = Arc::new(ChangeTracker::new(config.change_tracker_dir.clone()));

        // NOTE: the job manager's listener is the webhook notifier
        // directly, not a persistence-aware wrapper, to keep the one-way
        // edge manager -> listener free of any reach-back into job
        // state. Durable job/schedule snapshots are flushed by a
        // dedicated periodic task instead (see `run_flush_loop`).
        let manager_config = ManagerConfig {
            max_queue_size: config.max_queue_size,
            max_workers: config.worker_count,
            default_timeout: config.default_timeout,
            shutdown_drain_timeout: config.shutdown_drain_timeout,
        };
        let job_manager = if config.webhooks_enabled {
            Arc::new(JobManager::new(
                manager_config,
                registry.clone(),
                webhook_notifier.clone(),
                change_tracker.clone(),
            ))
        } else {
            Arc::new(JobManager::new(
                manager_config,
                registry.clone(),
                Arc::new(NullListener),
                change_tracker.clone(),
            ))
        };

        let scheduler = Arc::new(Scheduler::new(job_manager.clone(), config.scheduler_tick));
        scheduler.load(store.load_schedules().await?).await;

        let capability_detector = Arc::new(CapabilityDetector::new());

        Ok(Self {
            config,
            registry,
            job_manager,
            scheduler,
            webhook_notifier,
            store,
            change_tracker,
            capability_detector,
            worker_handles: Mutex::new(Vec::new()),
            scheduler_handle: Mutex::new(None),
            flush_handle: Mutex::new(None),
        })
    }

    /// Spawn the worker pool, the scheduler ticker, and the periodic
    /// durability flush. Detect host capabilities once up front.
    pub async fn start(&self) {
        info!(workers = self.config.worker_count, "starting job workers");
        *self.worker_handles.lock().await = spawn_workers(&self.job_manager, self.config.worker_count);

        let scheduler = self.scheduler.clone();
        *self.scheduler_handle.lock().await = Some(tokio::spawn(async move { scheduler.run().await }));

        let job_manager = self.job_manager.clone();
        let scheduler = self.scheduler.clone();
        let store = self.store.clone();
        let flush_interval = self.config.flush_interval;
        *self.flush_handle.lock().await = Some(tokio::spawn(async move {
            run_flush_loop(job_manager, scheduler, store, flush_interval).await;
        }));

        self.capability_detector.detect(Duration::from_secs(2)).await;
    }

    /// Add a schedule and persist it immediately so it's not lost if the
    /// process dies before the next periodic flush.
    pub async fn add_schedule(&self, schedule: Schedule) -> Result<Uuid> {
        let id = self.scheduler.add_schedule(schedule).await?;
        if let Some(stored) = self.scheduler.list().await.into_iter().find(|s| s.id == id) {
            self.store.save_schedule(&stored).await?;
        }
        Ok(id)
    }

    pub async fn remove_schedule(&self, id: Uuid) -> Result<()> {
        self.scheduler.remove_schedule(id).await;
        self.store.delete_schedule(id).await
    }

    pub async fn register_webhook(&self, webhook: Webhook) -> Result<()> {
        self.store.save_webhook(&webhook).await?;
        self.webhook_notifier.register(webhook).await;
        Ok(())
    }

    pub async fn unregister_webhook(&self, id: Uuid) -> Result<()> {
        self.store.delete_webhook(id).await?;
        self.webhook_notifier.unregister(id).await;
        Ok(())
    }

    /// Stop the scheduler, cancel in-flight jobs, wait for workers and
    /// background tasks to drain. Idempotent (delegates to
    /// `JobManager::shutdown`, itself idempotent).
    pub async fn shutdown(&self) {
        info!("kernel shutdown initiated");
        self.scheduler.stop();
        self.job_manager.shutdown().await;

        if let Some(handle) = self.flush_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.scheduler_handle.lock().await.take() {
            let _ = handle.await;
        }
        for handle in self.worker_handles.lock().await.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task panicked");
            }
        }
        info!("kernel shutdown complete");
    }
}

async fn run_flush_loop(
    job_manager: Arc<JobManager>,
    scheduler: Arc<Scheduler>,
    store: Arc<dyn DurableStore>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        for job in job_manager.query(None).await {
            if let Err(e) = store.save_job(&job).await {
                warn!(job_id = %job.id, error = %e, "failed to flush job");
            }
        }
        for schedule in scheduler.list().await {
            if let Err(e) = store.save_schedule(&schedule).await {
                warn!(schedule_id = %schedule.id, error = %e, "failed to flush schedule");
            }
        }
    }
}
