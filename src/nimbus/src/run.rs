use std::path::Path;

use anyhow::Result;

use cirrus::job::{JobConfig, JobRunner};
use cirrus::stage::{prepare_inputs_dir, JobArgs};
use cirrus::storage_s3::S3Client;

/// Drive one wrapped engine invocation: apply process limits, localize
/// remote arguments, run the job, and hand back the exit code to propagate.
pub fn start(
    engine: &Path,
    data_root: &Path,
    region: Option<String>,
    no_sign_request: bool,
    engine_args: Vec<String>,
) -> Result<i32> {
    cirrus::env::apply_resource_limits(Path::new(cirrus::env::LIMITS_CONF))?;

    let mut job_args = JobArgs::parse(engine_args)?;

    let store = if job_args.needs_object_store() {
        Some(S3Client::new(region, no_sign_request)?)
    } else {
        None
    };

    prepare_inputs_dir(data_root)?;

    cirrus::elog!("Localizing remote inputs");
    job_args.localize(store.as_ref(), data_root)?;

    let config = JobConfig {
        engine_path: engine.to_path_buf(),
        reset_path: engine.with_file_name("velox_reset"),
        data_root: data_root.to_path_buf(),
        ..JobConfig::default()
    };

    cirrus::elog!("Running analysis job");
    let report = JobRunner::new(config, job_args, store).run()?;

    Ok(report.exit_code)
}
