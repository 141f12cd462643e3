//! Integration tests for the job manager + worker pool against a mock
//! provider adapter, covering the invariant scenarios named in spec §8:
//! priority/FIFO ordering under saturation, retry-then-succeed, timeout
//! counted as its own terminal path, and cancel of both a pending and a
//! running job.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use hypersdk_core::change_tracker::ChangeTracker;
use hypersdk_core::job::events::NullListener;
use hypersdk_core::job::{spawn_workers, ExportPayload, JobManager, JobPriority, JobStatus, JobSubmission, ManagerConfig};
use hypersdk_core::provider::{
    ExportCapabilities, ExportOptions, ExportResult, ProgressSink, ProviderAdapter, ProviderConfig,
    ProviderError, ProviderRegistry, VMFilter, VMInfo,
};

/// A scripted adapter: fails the first `fail_times` attempts per vm id
/// with a transient error, then succeeds. Also supports a permanent
/// always-fail mode and a "hangs until cancelled" mode.
struct ScriptedAdapter {
    fail_times: u32,
    attempts: Mutex<std::collections::HashMap<String, u32>>,
    always_permanent: bool,
    hang_until_cancel: bool,
    hang_past_deadline: bool,
}

impl ScriptedAdapter {
    fn succeeding_after(fail_times: u32) -> Self {
        Self {
            fail_times,
            attempts: Mutex::new(Default::default()),
            always_permanent: false,
            hang_until_cancel: false,
            hang_past_deadline: false,
        }
    }

    fn always_permanent_failure() -> Self {
        Self {
            fail_times: 0,
            attempts: Mutex::new(Default::default()),
            always_permanent: true,
            hang_until_cancel: false,
            hang_past_deadline: false,
        }
    }

    fn hanging_until_cancelled() -> Self {
        Self {
            fail_times: 0,
            attempts: Mutex::new(Default::default()),
            always_permanent: false,
            hang_until_cancel: true,
            hang_past_deadline: false,
        }
    }

    fn hanging_past_deadline() -> Self {
        Self {
            fail_times: 0,
            attempts: Mutex::new(Default::default()),
            always_permanent: false,
            hang_until_cancel: false,
            hang_past_deadline: true,
        }
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }
    fn provider_type(&self) -> &str {
        "scripted"
    }
    async fn connect(&self, _config: &ProviderConfig) -> anyhow::Result<()> {
        Ok(())
    }
    async fn disconnect(&self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn validate_credentials(&self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn list_vms(&self, _filter: &VMFilter) -> anyhow::Result<Vec<VMInfo>> {
        Ok(vec![])
    }
    async fn get_vm(&self, id: &str) -> anyhow::Result<VMInfo> {
        anyhow::bail!("no such vm: {id}")
    }
    async fn search_vms(&self, _query: &str) -> anyhow::Result<Vec<VMInfo>> {
        Ok(vec![])
    }

    async fn export_vm(
        &self,
        id: &str,
        _opts: &ExportOptions,
        _sink: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<ExportResult, ProviderError> {
        if self.always_permanent {
            return Err(ProviderError::permanent("credentials rejected"));
        }
        if self.hang_until_cancel {
            cancel.cancelled().await;
            return Err(ProviderError::cancelled());
        }
        if self.hang_past_deadline {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!("worker should have given up before this returns");
        }

        let mut attempts = self.attempts.lock().await;
        let count = attempts.entry(id.to_string()).or_insert(0);
        *count += 1;
        if *count <= self.fail_times {
            return Err(ProviderError::transient("simulated transient failure"));
        }
        Ok(ExportResult {
            output_path: format!("/exports/{id}.ova"),
            total_size: 1024,
            disk_changes: vec![],
        })
    }

    fn export_capabilities(&self) -> ExportCapabilities {
        ExportCapabilities::default()
    }
}

async fn registry_with(adapter: Arc<dyn ProviderAdapter>) -> Arc<ProviderRegistry> {
    let registry = Arc::new(ProviderRegistry::new());
    registry
        .register("scripted", move |_cfg| Ok(adapter.clone()))
        .await;
    registry
}

fn submission(name: &str, priority: JobPriority, timeout: Duration, max_retries: u32) -> JobSubmission {
    JobSubmission::builder()
        .name(name)
        .priority(priority)
        .timeout(timeout)
        .max_retries(max_retries)
        .payload(ExportPayload {
            provider_type: "scripted".to_string(),
            provider_config: ProviderConfig::builder().endpoint("https://mock").build(),
            vm_id: name.to_string(),
            export_options: Default::default(),
        })
        .build()
}

async fn wait_for_terminal(manager: &JobManager, job_id: uuid::Uuid, timeout: Duration) -> hypersdk_core::job::Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = manager.get(job_id).await.unwrap();
        if job.is_terminal() {
            return job;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("job {job_id} did not reach a terminal state in time (status={:?})", job.status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn retry_then_succeed_preserves_job_id_and_counts_one_retry() {
    let adapter = Arc::new(ScriptedAdapter::succeeding_after(2));
    let registry = registry_with(adapter).await;
    let manager = Arc::new(JobManager::new(
        ManagerConfig {
            max_workers: 1,
            ..Default::default()
        },
        registry,
        Arc::new(NullListener),
        Arc::new(ChangeTracker::new(std::env::temp_dir())),
    ));
    let _workers = spawn_workers(&manager, 1);

    let job = manager.submit(submission("vm-retry", JobPriority::Normal, Duration::from_secs(5), 5)).await.unwrap();
    let id = job.id;

    let finished = wait_for_terminal(&manager, id, Duration::from_secs(5)).await;
    assert_eq!(finished.id, id);
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.attempt, 2);
    assert_eq!(manager.metrics().jobs_retried.load(Ordering::Relaxed), 2);
    assert_eq!(manager.metrics().jobs_completed.load(Ordering::Relaxed), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn permanent_failure_is_never_retried() {
    let adapter = Arc::new(ScriptedAdapter::always_permanent_failure());
    let registry = registry_with(adapter).await;
    let manager = Arc::new(JobManager::new(
        ManagerConfig {
            max_workers: 1,
            ..Default::default()
        },
        registry,
        Arc::new(NullListener),
        Arc::new(ChangeTracker::new(std::env::temp_dir())),
    ));
    let _workers = spawn_workers(&manager, 1);

    let job = manager.submit(submission("vm-bad-creds", JobPriority::Normal, Duration::from_secs(5), 5)).await.unwrap();
    let finished = wait_for_terminal(&manager, job.id, Duration::from_secs(5)).await;

    assert_eq!(finished.status, JobStatus::Failed);
    assert_eq!(finished.attempt, 0);
    assert_eq!(manager.metrics().jobs_retried.load(Ordering::Relaxed), 0);
    assert_eq!(manager.metrics().jobs_failed.load(Ordering::Relaxed), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn deadline_exceeded_is_counted_as_timeout_not_cancelled() {
    let adapter = Arc::new(ScriptedAdapter::hanging_past_deadline());
    let registry = registry_with(adapter).await;
    let manager = Arc::new(JobManager::new(
        ManagerConfig {
            max_workers: 1,
            ..Default::default()
        },
        registry,
        Arc::new(NullListener),
        Arc::new(ChangeTracker::new(std::env::temp_dir())),
    ));
    let _workers = spawn_workers(&manager, 1);

    let job = manager
        .submit(submission("vm-slow", JobPriority::Normal, Duration::from_millis(100), 0))
        .await
        .unwrap();
    let finished = wait_for_terminal(&manager, job.id, Duration::from_secs(5)).await;

    assert_eq!(finished.status, JobStatus::Failed);
    assert_eq!(finished.error_kind, Some(hypersdk_core::ErrorKind::Timeout));
    assert_eq!(manager.metrics().jobs_timeout.load(Ordering::Relaxed), 1);
    assert_eq!(manager.metrics().jobs_cancelled.load(Ordering::Relaxed), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn cancelling_a_pending_job_keeps_it_out_of_the_worker_entirely() {
    let adapter = Arc::new(ScriptedAdapter::always_permanent_failure());
    let registry = registry_with(adapter).await;
    // zero workers: job stays pending until we cancel it.
    let manager = Arc::new(JobManager::new(
        ManagerConfig::default(),
        registry,
        Arc::new(NullListener),
        Arc::new(ChangeTracker::new(std::env::temp_dir())),
    ));

    let job = manager.submit(submission("vm-cancel-pending", JobPriority::Normal, Duration::from_secs(5), 0)).await.unwrap();
    manager.cancel(job.id).await.unwrap();

    let fetched = manager.get(job.id).await.unwrap();
    assert_eq!(fetched.status, JobStatus::Cancelled);
    assert_eq!(manager.metrics().jobs_cancelled.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn cancelling_a_running_job_is_observed_by_the_adapter() {
    let adapter = Arc::new(ScriptedAdapter::hanging_until_cancelled());
    let registry = registry_with(adapter).await;
    let manager = Arc::new(JobManager::new(
        ManagerConfig {
            max_workers: 1,
            ..Default::default()
        },
        registry,
        Arc::new(NullListener),
        Arc::new(ChangeTracker::new(std::env::temp_dir())),
    ));
    let _workers = spawn_workers(&manager, 1);

    let job = manager.submit(submission("vm-cancel-running", JobPriority::Normal, Duration::from_secs(30), 0)).await.unwrap();

    // Give the worker a moment to pick it up and start the export.
    loop {
        if manager.get(job.id).await.unwrap().status == JobStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    manager.cancel(job.id).await.unwrap();
    let finished = wait_for_terminal(&manager, job.id, Duration::from_secs(5)).await;

    assert_eq!(finished.status, JobStatus::Cancelled);
    assert_eq!(manager.metrics().jobs_cancelled.load(Ordering::Relaxed), 1);
    assert_eq!(manager.metrics().jobs_timeout.load(Ordering::Relaxed), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn critical_priority_dequeues_before_earlier_normal_jobs() {
    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    struct RecordingAdapter {
        order: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ProviderAdapter for RecordingAdapter {
        fn name(&self) -> &str {
            "recording"
        }
        fn provider_type(&self) -> &str {
            "recording"
        }
        async fn connect(&self, _config: &ProviderConfig) -> anyhow::Result<()> {
            Ok(())
        }
        async fn disconnect(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn validate_credentials(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn list_vms(&self, _filter: &VMFilter) -> anyhow::Result<Vec<VMInfo>> {
            Ok(vec![])
        }
        async fn get_vm(&self, id: &str) -> anyhow::Result<VMInfo> {
            anyhow::bail!("no such vm: {id}")
        }
        async fn search_vms(&self, _query: &str) -> anyhow::Result<Vec<VMInfo>> {
            Ok(vec![])
        }
        async fn export_vm(
            &self,
            id: &str,
            _opts: &ExportOptions,
            _sink: ProgressSink,
            _cancel: CancellationToken,
        ) -> Result<ExportResult, ProviderError> {
            self.order.lock().await.push(id.to_string());
            Ok(ExportResult {
                output_path: format!("/exports/{id}.ova"),
                total_size: 1,
                disk_changes: vec![],
            })
        }
        fn export_capabilities(&self) -> ExportCapabilities {
            ExportCapabilities::default()
        }
    }

    // Workers are only spawned after every job below has been submitted,
    // so dequeue order reflects priority/FIFO ordering rather than a race
    // with submission.
    let adapter = Arc::new(RecordingAdapter { order: order.clone() });
    let registry = Arc::new(ProviderRegistry::new());
    registry.register("recording", move |_cfg| Ok(adapter.clone() as Arc<dyn ProviderAdapter>)).await;

    let manager = Arc::new(JobManager::new(
        ManagerConfig {
            max_workers: 1,
            ..Default::default()
        },
        registry,
        Arc::new(NullListener),
        Arc::new(ChangeTracker::new(std::env::temp_dir())),
    ));

    let mk = |name: &str, priority: JobPriority| JobSubmission::builder()
        .name(name)
        .priority(priority)
        .payload(ExportPayload {
            provider_type: "recording".to_string(),
            provider_config: ProviderConfig::builder().endpoint("https://mock").build(),
            vm_id: name.to_string(),
            export_options: Default::default(),
        })
        .build();

    manager.submit(mk("low-1", JobPriority::Low)).await.unwrap();
    manager.submit(mk("normal-1", JobPriority::Normal)).await.unwrap();
    manager.submit(mk("critical-1", JobPriority::Critical)).await.unwrap();
    manager.submit(mk("normal-2", JobPriority::Normal)).await.unwrap();

    let _workers = spawn_workers(&manager, 1);

    loop {
        if order.lock().await.len() == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let observed = order.lock().await.clone();
    assert_eq!(observed, vec!["critical-1", "normal-1", "normal-2", "low-1"]);

    manager.shutdown().await;
}
