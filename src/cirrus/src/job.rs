use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::stage::{ArgKind, JobArgs};
use crate::storage_local::{ensure_dir, newest_matching_file};
use crate::storage_s3::{is_s3_url, split_s3_url, S3Client};
use crate::utils::{seconds_to_hr_min_sec, signal_from_exit_code};

pub const DEFAULT_ENGINE_PATH: &str = "/opt/velox/bin/velox";
pub const DEFAULT_RESET_PATH: &str = "/opt/velox/bin/velox_reset";
pub const DEFAULT_DATA_ROOT: &str = "/ephemeral";
pub const DEFAULT_DIAG_LOG_DIR: &str = "/var/log/velox";

/// Marker file recording that the FPGA image has already been programmed on
/// this host; priming is skipped while it exists.
pub const FPGA_MARKER_FILE: &str = "fpga_image_loaded";

/// Engine status file the wrapper asks for, relative to the working directory.
pub const STATUS_FILE_NAME: &str = "job-speedometer.log";

/// Diagnostic files collected from the system log directory after a failed
/// run. For each pattern, only the most recent match is taken.
pub const DIAG_FILE_PATTERNS: &[&str] =
    &["velox_run*", "hang_diag*", "pstack*", "velox_info*", "velox_replay*"];

const ENGINE_PRIME_ARGS: &[&str] =
    &["--partial-reconfig", "DNA-MAPPER", "--ignore-version-check", "true", "-Z", "0"];

/// Filesystem and tool locations for one job. Defaults match the production
/// image layout; tests point these at scratch directories and stub scripts.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub engine_path: PathBuf,
    pub reset_path: PathBuf,
    pub data_root: PathBuf,
    pub diag_log_dir: PathBuf,
}

impl Default for JobConfig {
    fn default() -> Self {
        JobConfig {
            engine_path: PathBuf::from(DEFAULT_ENGINE_PATH),
            reset_path: PathBuf::from(DEFAULT_RESET_PATH),
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
            diag_log_dir: PathBuf::from(DEFAULT_DIAG_LOG_DIR),
        }
    }
}

impl JobConfig {
    #[must_use]
    pub fn fpga_marker_path(&self) -> PathBuf {
        self.data_root.join(FPGA_MARKER_FILE)
    }

    /// Spill directory for engine intermediate results; shares the ephemeral
    /// volume with everything else.
    #[must_use]
    pub fn spill_dir(&self) -> &Path {
        &self.data_root
    }
}

/// What the wrapper reports after a run.
#[derive(Debug)]
pub struct JobReport {
    /// The engine's exit code, propagated as the process exit status.
    pub exit_code: i32,
    /// The terminating signal derived from the exit code, when applicable.
    pub signal: Option<i32>,
    /// False when the output upload failed after a failed engine run; the
    /// engine's exit code still wins in that case.
    pub upload_ok: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
enum FailurePolicy {
    /// Abort the run; the process exits with a configuration error.
    FatalAbort,
    /// Log the failure and move on to the next step.
    LogAndContinue,
}

type StepFn = fn(&mut JobRunner) -> Result<()>;

struct Step {
    name: &'static str,
    policy: FailurePolicy,
    run: StepFn,
}

/// The fixed step sequence. Order matters: diagnostics are collected before
/// upload so a failed run's traces land in the uploaded tree, and strictly
/// before cleanup deletes the working directory.
const STEPS: &[Step] = &[
    Step { name: "FPGA priming", policy: FailurePolicy::LogAndContinue, run: JobRunner::prime_fpga },
    Step { name: "board health check", policy: FailurePolicy::LogAndContinue, run: JobRunner::check_board_state },
    Step { name: "working directory provisioning", policy: FailurePolicy::FatalAbort, run: JobRunner::provision_workdir },
    Step { name: "engine execution", policy: FailurePolicy::FatalAbort, run: JobRunner::execute_engine },
    Step { name: "diagnostics collection", policy: FailurePolicy::LogAndContinue, run: JobRunner::collect_diagnostics },
    Step { name: "output upload", policy: FailurePolicy::FatalAbort, run: JobRunner::upload_outputs },
    Step { name: "working directory cleanup", policy: FailurePolicy::LogAndContinue, run: JobRunner::cleanup },
];

/// Sequential orchestrator for one engine invocation: primes the FPGA, checks
/// board health, provisions a working directory, runs the engine, uploads the
/// results, and cleans up. One instance owns one working directory; nothing
/// is shared between invocations except the reference cache.
pub struct JobRunner {
    config: JobConfig,
    job_args: JobArgs,
    store: Option<S3Client>,
    output_url: Option<String>,
    workdir: Option<PathBuf>,
    engine_exit: i32,
    upload_ok: bool,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl JobRunner {
    #[must_use]
    pub fn new(config: JobConfig, job_args: JobArgs, store: Option<S3Client>) -> Self {
        let output_url = job_args.output_url().map(std::string::ToString::to_string);

        JobRunner {
            config,
            job_args,
            store,
            output_url,
            workdir: None,
            engine_exit: 0,
            upload_ok: true,
            started_at: None,
            finished_at: None,
        }
    }

    /// Run every step in order, honoring each step's failure policy. A fatal
    /// step failure still removes the working directory before returning, so
    /// an aborted job never leaves its scratch space behind.
    pub fn run(&mut self) -> Result<JobReport> {
        for step in STEPS {
            if let Err(e) = (step.run)(self) {
                match step.policy {
                    FailurePolicy::FatalAbort => {
                        let _ = self.cleanup();
                        return Err(e.context(format!("Step '{}' failed", step.name)));
                    }
                    FailurePolicy::LogAndContinue => {
                        crate::elog!("Warning: step '{}' failed: {:#}", step.name, e);
                    }
                }
            }
        }

        let signal = signal_from_exit_code(self.engine_exit);
        if let Some(signum) = signal {
            crate::elog!("Job terminated due to signal {}", signum);
        }

        if let (Some(start), Some(end)) = (self.started_at, self.finished_at) {
            let secs = (end - start).num_seconds().max(0) as u64;
            crate::elog!("Job ran for {}", seconds_to_hr_min_sec(secs));
        }

        Ok(JobReport {
            exit_code: self.engine_exit,
            signal,
            upload_ok: self.upload_ok,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }

    /// Program the FPGA image unless the marker file says a previous job on
    /// this host already did. Best-effort: the job proceeds either way.
    fn prime_fpga(&mut self) -> Result<()> {
        let marker = self.config.fpga_marker_path();
        if marker.is_file() {
            return Ok(());
        }

        let engine = self.config.engine_path.clone();
        let code = self.exec_tool(&engine, ENGINE_PRIME_ARGS)?;
        if code != 0 {
            bail!("Could not program FPGA image (exit code {})", code);
        }

        ensure_dir(&self.config.data_root)?;
        std::fs::write(&marker, "1")?;
        crate::elog!("Completed FPGA image programming");
        Ok(())
    }

    /// Probe the board state; on a bad report, reset it unconditionally. The
    /// reset's own exit code is not checked.
    fn check_board_state(&mut self) -> Result<()> {
        let reset = self.config.reset_path.clone();
        let code = self.exec_tool(&reset, &["-cv"])?;
        if code != 0 {
            crate::elog!("Board is in a bad state - running reset");
            let _ = self.exec_tool(&reset, &[]);
        }
        Ok(())
    }

    /// Create the unique working directory and point the engine's output
    /// argument at it.
    fn provision_workdir(&mut self) -> Result<()> {
        let workdir = self.config.data_root.join(Uuid::new_v4().to_string());

        if workdir.exists() {
            crate::elog!("Working directory {} already exists - skip creating", workdir.display());
        } else {
            crate::elog!("Creating working directory {}", workdir.display());
            ensure_dir(&workdir)?;
        }

        if let Some(found) = self.job_args.first_of_kind(ArgKind::OutputDir) {
            let index = found.index;
            self.job_args.rewrite(index, &workdir.to_string_lossy());
        }

        self.workdir = Some(workdir);
        Ok(())
    }

    /// Launch the engine with the localized argument vector plus the
    /// wrapper's operational flags, and block until it exits. Combined
    /// stdout/stderr goes to a log file inside the working directory.
    fn execute_engine(&mut self) -> Result<()> {
        let workdir = self.workdir_required()?.to_path_buf();

        self.job_args.push_args([
            "--output_status_file".to_string(),
            workdir.join(STATUS_FILE_NAME).to_string_lossy().into_owned(),
            "--intermediate-results-dir".to_string(),
            self.config.spill_dir().to_string_lossy().into_owned(),
            "--lic-no-print".to_string(),
        ]);

        let log_path = workdir.join(format!("velox_log_{}.txt", Utc::now().timestamp()));
        let log_file = File::create(&log_path)
            .with_context(|| format!("Could not create engine log {}", log_path.display()))?;

        crate::elog!(
            "Executing {} {}",
            self.config.engine_path.display(),
            self.job_args.args().join(" ")
        );

        self.started_at = Some(Utc::now());
        let status = Command::new(&self.config.engine_path)
            .args(self.job_args.args())
            .stdout(Stdio::from(log_file.try_clone()?))
            .stderr(Stdio::from(log_file))
            .status()
            .with_context(|| {
                format!("Could not launch engine {}", self.config.engine_path.display())
            })?;
        self.finished_at = Some(Utc::now());

        self.engine_exit = exit_code_of(status);
        crate::elog!("Engine exited with code {}", self.engine_exit);
        Ok(())
    }

    /// After a failed run, copy the freshest diagnostic file for each known
    /// pattern from the system log directory into the working directory.
    fn collect_diagnostics(&mut self) -> Result<()> {
        if self.engine_exit == 0 {
            return Ok(());
        }

        let workdir = self.workdir_required()?.to_path_buf();
        for pattern in DIAG_FILE_PATTERNS {
            let full_pattern = self.config.diag_log_dir.join(pattern);
            let newest = newest_matching_file(&full_pattern.to_string_lossy())?;

            if let Some(path) = newest {
                let name = path
                    .file_name()
                    .ok_or_else(|| anyhow!("Diagnostic path {} has no file name", path.display()))?;
                std::fs::copy(&path, workdir.join(name))?;
                crate::elog!("Collected diagnostic file {}", path.display());
            }
        }

        Ok(())
    }

    /// Push the working directory tree to the remote output location. When
    /// the engine itself failed, an upload failure is logged but must not
    /// replace the engine's exit code.
    fn upload_outputs(&mut self) -> Result<()> {
        let Some(output_url) = self.output_url.clone() else {
            crate::elog!("No remote output location specified - skipping upload");
            return Ok(());
        };

        if !is_s3_url(&output_url) {
            crate::elog!("Output location {} is local - skipping upload", output_url);
            return Ok(());
        }

        let workdir = self.workdir_required()?.to_path_buf();
        let result = (|| -> Result<u64> {
            let (bucket, key) = split_s3_url(&output_url)?;
            if key.is_empty() {
                bail!("Output URL '{}' has no key prefix", output_url);
            }

            let store = self
                .store
                .as_ref()
                .ok_or_else(|| anyhow!("Output upload needs object storage, but no client is configured"))?;

            store.upload_tree(&workdir, &bucket, &key)
        })();

        match result {
            Ok(bytes) => {
                crate::elog!("Uploaded {} bytes to {}", bytes, output_url);
                Ok(())
            }
            Err(e) => {
                self.upload_ok = false;
                if self.engine_exit != 0 {
                    // The engine failure is the signal worth keeping.
                    crate::elog!("Warning: output upload failed after engine failure: {:#}", e);
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Remove the working directory. Failures are swallowed; the reference
    /// cache under the data root is never touched.
    fn cleanup(&mut self) -> Result<()> {
        if let Some(workdir) = self.workdir.take() {
            crate::elog!("Removing working directory {}", workdir.display());
            let _ = std::fs::remove_dir_all(&workdir);
        }
        Ok(())
    }

    fn workdir_required(&self) -> Result<&Path> {
        self.workdir
            .as_deref()
            .ok_or_else(|| anyhow!("Working directory has not been provisioned"))
    }

    /// Run a hardware tool with stdio inherited and return its exit code.
    fn exec_tool(&self, tool: &Path, args: &[&str]) -> Result<i32> {
        crate::elog!("Executing {} {}", tool.display(), args.join(" "));

        let status = Command::new(tool)
            .args(args)
            .status()
            .with_context(|| format!("Could not launch {}", tool.display()))?;

        Ok(exit_code_of(status))
    }
}

/// Map an exit status to a code. A child killed by signal N has no code and
/// is reported as 128+N, matching shell convention.
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signum) = status.signal() {
            return 128 + signum;
        }
    }

    status.code().unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::JobArgs;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn test_config(tmp: &Path, engine_body: &str) -> JobConfig {
        let data_root = tmp.join("ephemeral");
        std::fs::create_dir_all(&data_root).unwrap();
        // Marker present so priming never runs the stub with reconfig args.
        std::fs::write(data_root.join(FPGA_MARKER_FILE), "1").unwrap();

        let diag_dir = tmp.join("var_log");
        std::fs::create_dir_all(&diag_dir).unwrap();

        JobConfig {
            engine_path: write_script(tmp, "velox", engine_body),
            reset_path: write_script(tmp, "velox_reset", "exit 0"),
            data_root,
            diag_log_dir: diag_dir,
        }
    }

    fn runner_for(config: JobConfig, tokens: &[&str]) -> JobRunner {
        let args = JobArgs::parse(tokens.iter().map(|s| (*s).to_string()).collect()).unwrap();
        JobRunner::new(config, args, None)
    }

    #[test]
    fn test_successful_run_exits_zero_and_cleans_up() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = test_config(tmp.path(), "exit 0");
        let data_root = config.data_root.clone();

        let mut runner = runner_for(config, &["--output-directory", "/tmp/ignored"]);
        let report = runner.run().unwrap();

        assert_eq!(report.exit_code, 0);
        assert_eq!(report.signal, None);
        assert!(report.upload_ok);

        // Only the marker and inputs remain; the workdir is gone.
        let leftovers: Vec<_> = std::fs::read_dir(&data_root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name != FPGA_MARKER_FILE)
            .collect();
        assert!(leftovers.is_empty(), "unexpected leftovers: {leftovers:?}");
    }

    #[test]
    fn test_signal_exit_code_is_propagated_and_logged() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = test_config(tmp.path(), "exit 137");

        let mut runner = runner_for(config, &["--output-directory", "/tmp/ignored"]);
        let report = runner.run().unwrap();

        assert_eq!(report.exit_code, 137);
        assert_eq!(report.signal, Some(9));
    }

    #[test]
    fn test_failed_run_collects_freshest_diagnostics() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = test_config(tmp.path(), "exit 2");

        let stale = config.diag_log_dir.join("velox_run_100.log");
        let fresh = config.diag_log_dir.join("velox_run_200.log");
        std::fs::write(&stale, "stale").unwrap();
        std::fs::write(&fresh, "fresh").unwrap();
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(60);
        let f = std::fs::File::options().append(true).open(&fresh).unwrap();
        f.set_modified(later).unwrap();
        std::fs::write(config.diag_log_dir.join("hang_diag_1.txt"), "hang").unwrap();

        let mut runner = runner_for(config, &["--output-directory", "/tmp/ignored"]);

        // Drive the steps up to diagnostics by hand so the working directory
        // can be inspected before cleanup removes it.
        runner.provision_workdir().unwrap();
        runner.execute_engine().unwrap();
        assert_eq!(runner.engine_exit, 2);

        runner.collect_diagnostics().unwrap();
        let workdir = runner.workdir.clone().unwrap();
        assert!(workdir.join("velox_run_200.log").is_file());
        assert!(!workdir.join("velox_run_100.log").exists());
        assert!(workdir.join("hang_diag_1.txt").is_file());

        runner.cleanup().unwrap();
        assert!(!workdir.exists());
    }

    #[test]
    fn test_output_argument_is_rewritten_to_workdir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = test_config(tmp.path(), "exit 0");
        let data_root = config.data_root.clone();

        let mut runner = runner_for(config, &["--output-directory", "s3://results/sample1"]);
        runner.provision_workdir().unwrap();

        let rewritten = &runner.job_args.args()[1];
        assert!(rewritten.starts_with(&data_root.to_string_lossy().into_owned()));
        assert_eq!(runner.output_url.as_deref(), Some("s3://results/sample1"));
    }

    #[test]
    fn test_engine_log_and_status_flags_are_injected() {
        let tmp = tempfile::TempDir::new().unwrap();
        // The stub records its arguments so the injected flags can be checked.
        let argfile = tmp.path().join("seen_args");
        let config = test_config(tmp.path(), &format!("echo \"$@\" > {}", argfile.display()));

        let mut runner = runner_for(config, &["--output-directory", "/tmp/ignored"]);
        runner.provision_workdir().unwrap();
        runner.execute_engine().unwrap();

        let seen = std::fs::read_to_string(&argfile).unwrap();
        assert!(seen.contains("--output_status_file"));
        assert!(seen.contains(STATUS_FILE_NAME));
        assert!(seen.contains("--intermediate-results-dir"));
        assert!(seen.contains("--lic-no-print"));

        // Engine stdout went into a log file inside the working directory.
        let workdir = runner.workdir.clone().unwrap();
        let logs: Vec<_> = std::fs::read_dir(&workdir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("velox_log_"))
            .collect();
        assert_eq!(logs.len(), 1);
    }

    #[test]
    fn test_missing_engine_is_fatal() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = test_config(tmp.path(), "exit 0");
        config.engine_path = tmp.path().join("no_such_engine");

        let mut runner = runner_for(config, &["--output-directory", "/tmp/ignored"]);
        assert!(runner.run().is_err());
    }

    #[test]
    fn test_fatal_step_failure_still_removes_workdir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = test_config(tmp.path(), "exit 0");
        config.engine_path = tmp.path().join("no_such_engine");
        let data_root = config.data_root.clone();

        let mut runner = runner_for(config, &["--output-directory", "/tmp/ignored"]);
        assert!(runner.run().is_err());

        // The engine launch failed after the working directory was created;
        // the abort path must still have removed it.
        let leftovers: Vec<_> = std::fs::read_dir(&data_root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name != FPGA_MARKER_FILE)
            .collect();
        assert!(leftovers.is_empty(), "unexpected leftovers: {leftovers:?}");
    }

    #[test]
    fn test_priming_failure_is_nonfatal() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = test_config(tmp.path(), "exit 0");

        // Remove the marker; priming will call the stub engine, which exits 0
        // here, so the marker gets written back.
        std::fs::remove_file(config.fpga_marker_path()).unwrap();

        let mut runner = runner_for(config.clone(), &["--output-directory", "/tmp/ignored"]);
        let report = runner.run().unwrap();

        assert_eq!(report.exit_code, 0);
        assert!(config.fpga_marker_path().is_file());
    }
}
