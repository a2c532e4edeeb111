use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use anyhow::{anyhow, bail, Context, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_batch::types::{ContainerOverrides, JobStatus, RetryStrategy};

/// The closed status vocabulary reported to the workflow manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Native batch status names mapped onto the internal vocabulary. Built once;
/// never mutated.
static STATUS_MAP: LazyLock<HashMap<&'static str, JobState>> = LazyLock::new(|| {
    HashMap::from([
        ("SUBMITTED", JobState::Pending),
        ("PENDING", JobState::Pending),
        ("RUNNABLE", JobState::Pending),
        ("STARTING", JobState::Running),
        ("RUNNING", JobState::Running),
        ("SUCCEEDED", JobState::Completed),
        ("FAILED", JobState::Failed),
    ])
});

/// Translate a native batch status name.
///
/// # Errors
///
/// An unknown status is a data-contract violation and is raised to the
/// caller rather than mapped to a default bucket.
pub fn map_status(native: &str) -> Result<JobState> {
    STATUS_MAP
        .get(native)
        .copied()
        .ok_or_else(|| anyhow!("Unknown batch job status '{}'", native))
}

/// A batch job as the cloud service describes it. Timestamps are epoch
/// seconds. Translated transiently; never stored.
#[derive(Debug, Clone, Default)]
pub struct BatchJobRecord {
    pub id: String,
    pub name: String,
    pub status: String,
    pub created_at: Option<i64>,
    pub started_at: Option<i64>,
    pub stopped_at: Option<i64>,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
}

/// The translated view handed to the workflow manager. Which fields are
/// populated depends on the state: terminal states carry start/stop times,
/// exit code, and failure reason; a running job carries only its start time;
/// a pending job carries no timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatusReport {
    pub state: JobState,
    pub started_at: Option<i64>,
    pub stopped_at: Option<i64>,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
}

/// Translate a native job record into the internal status report.
pub fn summarize(record: &BatchJobRecord) -> Result<JobStatusReport> {
    let state = map_status(&record.status)?;

    let report = match state {
        JobState::Pending => JobStatusReport {
            state,
            started_at: None,
            stopped_at: None,
            exit_code: None,
            reason: None,
        },
        JobState::Running => JobStatusReport {
            state,
            started_at: record.started_at,
            stopped_at: None,
            exit_code: None,
            reason: None,
        },
        JobState::Completed | JobState::Failed => JobStatusReport {
            state,
            started_at: record.started_at,
            stopped_at: record.stopped_at,
            exit_code: record.exit_code,
            reason: record.reason.clone(),
        },
    };

    Ok(report)
}

/// Queue and job-definition names for one (region, instance type) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueTarget {
    pub queue: &'static str,
    pub definition: &'static str,
}

/// Deployed queue/definition pairs, keyed by (region, instance type). The
/// deployment templates create these names; anything else is a
/// misconfiguration.
static QUEUE_TABLE: LazyLock<HashMap<(&'static str, &'static str), QueueTarget>> =
    LazyLock::new(|| {
        HashMap::from([
            (
                ("us-east-1", "f1.2xlarge"),
                QueueTarget { queue: "velox-queue-f1-2x", definition: "velox-jobdef-f1-2x" },
            ),
            (
                ("us-east-1", "f1.4xlarge"),
                QueueTarget { queue: "velox-queue-f1-4x", definition: "velox-jobdef-f1-4x" },
            ),
            (
                ("us-east-1", "f1.16xlarge"),
                QueueTarget { queue: "velox-queue-f1-16x", definition: "velox-jobdef-f1-16x" },
            ),
            (
                ("us-west-2", "f1.2xlarge"),
                QueueTarget { queue: "velox-queue-f1-2x", definition: "velox-jobdef-f1-2x" },
            ),
            (
                ("us-west-2", "f1.4xlarge"),
                QueueTarget { queue: "velox-queue-f1-4x", definition: "velox-jobdef-f1-4x" },
            ),
            (
                ("eu-west-1", "f1.2xlarge"),
                QueueTarget { queue: "velox-queue-f1-2x", definition: "velox-jobdef-f1-2x" },
            ),
        ])
    });

/// Resolve the queue and job definition deployed for a region and instance
/// type.
pub fn resolve_queue(region: &str, instance_type: &str) -> Result<QueueTarget> {
    QUEUE_TABLE
        .get(&(region, instance_type))
        .copied()
        .ok_or_else(|| {
            anyhow!("No batch queue deployed for region '{}' and instance type '{}'", region, instance_type)
        })
}

fn millis_to_secs(millis: Option<i64>) -> Option<i64> {
    millis.map(|ms| ms / 1_000)
}

/// Synchronous wrapper over the managed batch service, used by the
/// scheduling daemon rather than the job runner itself.
pub struct BatchClient {
    runtime: tokio::runtime::Runtime,
    client: aws_sdk_batch::Client,
}

impl BatchClient {
    pub fn new(region: Option<String>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("Could not start async runtime for batch service")?;

        let config = runtime.block_on(async {
            let region_provider = RegionProviderChain::first_try(region.map(Region::new))
                .or_default_provider()
                .or_else(Region::new("us-east-1"));

            aws_config::defaults(BehaviorVersion::latest())
                .region(region_provider)
                .load()
                .await
        });

        Ok(BatchClient {
            runtime,
            client: aws_sdk_batch::Client::new(&config),
        })
    }

    /// Submit a job with a container command override. Retries are
    /// declarative: the service re-attempts the job server-side, the wrapper
    /// never retries anything itself.
    pub fn submit_job(
        &self,
        name: &str,
        target: QueueTarget,
        command: Vec<String>,
        retry_attempts: i32,
    ) -> Result<String> {
        let overrides = ContainerOverrides::builder().set_command(Some(command)).build();
        let retry = RetryStrategy::builder().attempts(retry_attempts).build();

        let response = self
            .runtime
            .block_on(
                self.client
                    .submit_job()
                    .job_name(name)
                    .job_queue(target.queue)
                    .job_definition(target.definition)
                    .container_overrides(overrides)
                    .retry_strategy(retry)
                    .send(),
            )
            .map_err(|e| anyhow!("Could not submit job '{}': {}", name, e))?;

        response
            .job_id()
            .map(std::string::ToString::to_string)
            .ok_or_else(|| anyhow!("Job submission for '{}' returned no job id", name))
    }

    /// Describe one job as a [`BatchJobRecord`], timestamps converted from
    /// the service's milliseconds to epoch seconds.
    pub fn describe_job(&self, job_id: &str) -> Result<BatchJobRecord> {
        let response = self
            .runtime
            .block_on(self.client.describe_jobs().jobs(job_id).send())
            .map_err(|e| anyhow!("Could not describe job '{}': {}", job_id, e))?;

        let detail = response
            .jobs()
            .first()
            .ok_or_else(|| anyhow!("Batch service knows no job '{}'", job_id))?;

        Ok(BatchJobRecord {
            id: detail.job_id().unwrap_or_default().to_string(),
            name: detail.job_name().unwrap_or_default().to_string(),
            status: detail.status().map(JobStatus::as_str).unwrap_or_default().to_string(),
            created_at: millis_to_secs(detail.created_at()),
            started_at: millis_to_secs(detail.started_at()),
            stopped_at: millis_to_secs(detail.stopped_at()),
            exit_code: detail.container().and_then(|c| c.exit_code()),
            reason: detail.status_reason().map(std::string::ToString::to_string),
        })
    }

    /// Describe and translate in one step; the polling entry point.
    pub fn job_status(&self, job_id: &str) -> Result<JobStatusReport> {
        let record = self.describe_job(job_id)?;
        summarize(&record)
    }

    /// Cancel a job that has not started running yet.
    pub fn cancel_job(&self, job_id: &str, reason: &str) -> Result<()> {
        self.runtime
            .block_on(self.client.cancel_job().job_id(job_id).reason(reason).send())
            .map_err(|e| anyhow!("Could not cancel job '{}': {}", job_id, e))?;
        Ok(())
    }

    /// Terminate a job, killing it if it is already running.
    pub fn terminate_job(&self, job_id: &str, reason: &str) -> Result<()> {
        self.runtime
            .block_on(self.client.terminate_job().job_id(job_id).reason(reason).send())
            .map_err(|e| anyhow!("Could not terminate job '{}': {}", job_id, e))?;
        Ok(())
    }

    /// List (id, name) pairs of jobs in a queue filtered by native status.
    pub fn list_jobs(&self, queue: &str, native_status: &str) -> Result<Vec<(String, String)>> {
        if !STATUS_MAP.contains_key(native_status) {
            bail!("Unknown batch job status '{}'", native_status);
        }

        let response = self
            .runtime
            .block_on(
                self.client
                    .list_jobs()
                    .job_queue(queue)
                    .job_status(JobStatus::from(native_status))
                    .send(),
            )
            .map_err(|e| anyhow!("Could not list jobs in queue '{}': {}", queue, e))?;

        let jobs = response
            .job_summary_list()
            .iter()
            .map(|summary| {
                (
                    summary.job_id().unwrap_or_default().to_string(),
                    summary.job_name().unwrap_or_default().to_string(),
                )
            })
            .collect();

        Ok(jobs)
    }
}
