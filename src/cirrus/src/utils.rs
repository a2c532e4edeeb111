use std::borrow::Cow;

use anyhow::{anyhow, Result};
use url::Url;

/// This function takes an object URL and returns the final path segment with any
/// query string removed, suitable for use as a local file name. Pre-signed URLs
/// carry their signature in the query string, which must never leak into paths.
///
/// # Arguments
///
/// * `url` - A reference to a URL object pointing at a remote object.
///
/// # Returns
///
/// * A `String` containing the file name portion of the URL path.
pub fn basename_from_url(url: &Url) -> Result<String> {
    let basename = url
        .path_segments()
        .and_then(|segments| segments.last().map(std::string::ToString::to_string))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("URL '{}' has no file name component", url))?;

    Ok(basename)
}

/// Format a number of seconds as `H:MM:SS` for human-readable duration reports.
#[must_use]
pub fn seconds_to_hr_min_sec(secs: u64) -> String {
    let (m, s) = (secs / 60, secs % 60);
    let (h, m) = (m / 60, m % 60);
    format!("{}:{:02}:{:02}", h, m, s)
}

/// Derive the terminating signal number from a process exit code, if the code
/// indicates death by signal (greater than 128, or negative).
#[must_use]
pub fn signal_from_exit_code(code: i32) -> Option<i32> {
    if code > 128 {
        Some(code - 128)
    } else if code < 0 {
        Some(-code)
    } else {
        None
    }
}

/// Progress bar for bounded multi-object transfers, counting objects rather
/// than bytes.
pub fn default_bounded_progress_bar(
    msg: impl Into<Cow<'static, str>>,
    len: u64,
) -> indicatif::ProgressBar {
    let style = indicatif::ProgressStyle::default_bar()
        .template("{msg} [{elapsed_precise}] {bar:40.cyan/blue} {human_pos}/{human_len} objects ({eta})")
        .unwrap()
        .progress_chars("=>-");

    let bar = indicatif::ProgressBar::new(len);
    bar.set_style(style);
    bar.set_message(msg);

    bar
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_basename_from_url_strips_query() {
        let url = Url::parse("https://example.com/runs/fastq_list.csv?X-Amz-Signature=abc123").unwrap();
        assert_eq!(basename_from_url(&url).unwrap(), "fastq_list.csv");
    }

    #[test]
    fn test_basename_from_url_s3() {
        let url = Url::parse("s3://mybucket/inputs/targets.bed").unwrap();
        assert_eq!(basename_from_url(&url).unwrap(), "targets.bed");
    }

    #[test]
    fn test_basename_from_url_rejects_bare_bucket() {
        let url = Url::parse("s3://mybucket").unwrap();
        assert!(basename_from_url(&url).is_err());
    }

    #[test]
    fn test_seconds_to_hr_min_sec() {
        assert_eq!(seconds_to_hr_min_sec(0), "0:00:00");
        assert_eq!(seconds_to_hr_min_sec(61), "0:01:01");
        assert_eq!(seconds_to_hr_min_sec(3_725), "1:02:05");
    }

    #[test]
    fn test_signal_from_exit_code() {
        assert_eq!(signal_from_exit_code(137), Some(9));
        assert_eq!(signal_from_exit_code(-15), Some(15));
        assert_eq!(signal_from_exit_code(2), None);
        assert_eq!(signal_from_exit_code(0), None);
    }
}
