use std::path::PathBuf;

use clap::Parser;

mod run;

#[derive(Debug, Parser)]
#[clap(name = "nimbus")]
#[clap(about = "Quick-start wrapper that localizes remote inputs, runs the velox engine, and uploads results.", long_about = None)]
struct Cli {
    /// Path to the velox engine binary.
    #[clap(long, value_parser, default_value = cirrus::job::DEFAULT_ENGINE_PATH)]
    engine: PathBuf,

    /// Root of the ephemeral data volume holding inputs, working
    /// directories, and the reference cache.
    #[clap(long, value_parser, default_value = cirrus::job::DEFAULT_DATA_ROOT)]
    data_root: PathBuf,

    /// Object storage region; falls back to the environment's default chain.
    #[clap(long, value_parser)]
    region: Option<String>,

    /// Access the object store without request signing (public buckets).
    #[clap(long)]
    no_sign_request: bool,

    /// Engine argument vector, passed through after remote inputs have been
    /// localized. Prefix with '--' to keep engine flags out of the wrapper's
    /// own option parsing.
    #[clap(required = true, allow_hyphen_values = true, trailing_var_arg = true, value_parser)]
    engine_args: Vec<String>,
}

fn main() {
    let args = Cli::parse();

    cirrus::elog!("Nimbus version {}", env!("CARGO_PKG_VERSION"));

    let exit_code = match run::start(
        &args.engine,
        &args.data_root,
        args.region,
        args.no_sign_request,
        args.engine_args,
    ) {
        Ok(code) => code,
        Err(e) => {
            cirrus::elog!("Error: {:#}", e);
            1
        }
    };

    cirrus::elog!("Job is exiting with code {}", exit_code);
    std::process::exit(exit_code);
}
