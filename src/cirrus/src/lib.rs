pub mod batch;
pub mod env;
pub mod job;
pub mod scale;
pub mod stage;
pub mod storage_local;
pub mod storage_s3;
pub mod utils;

/// Log a timestamped message to stderr.
#[macro_export]
macro_rules! elog {
    ($($arg:tt)*) => {{
        eprintln!(
            "[{}] {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            format_args!($($arg)*)
        );
    }};
}
