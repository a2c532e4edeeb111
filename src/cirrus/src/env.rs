use std::path::Path;

use anyhow::Result;
use nix::sys::resource::{setrlimit, Resource, RLIM_INFINITY};

/// Host configuration file that may override the default process limits.
pub const LIMITS_CONF: &str = "/etc/security/limits.d/99-velox.conf";

const DEFAULT_NPROC: u64 = 16_384;
const DEFAULT_NOFILE: u64 = 65_535;
const DEFAULT_STACK_BYTES: u64 = 10_240 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    Nproc,
    Nofile,
    Stack,
}

impl LimitKind {
    fn from_item(item: &str) -> Option<Self> {
        match item {
            "nproc" => Some(LimitKind::Nproc),
            "nofile" => Some(LimitKind::Nofile),
            "stack" => Some(LimitKind::Stack),
            _ => None,
        }
    }

    fn as_resource(self) -> Resource {
        match self {
            LimitKind::Nproc => Resource::RLIMIT_NPROC,
            LimitKind::Nofile => Resource::RLIMIT_NOFILE,
            LimitKind::Stack => Resource::RLIMIT_STACK,
        }
    }
}

/// Parse a `limits.d`-style configuration, keeping only wildcard-domain lines
/// for the limit kinds we manage. Stack values are given in KB in the file
/// but `setrlimit` takes bytes.
pub fn parse_limits_conf(contents: &str) -> Vec<(LimitKind, u64)> {
    let mut limits = Vec::new();

    for line in contents.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[0] != "*" {
            continue;
        }

        let Some(kind) = LimitKind::from_item(fields[2]) else {
            continue;
        };

        let value = if fields[3] == "unlimited" {
            RLIM_INFINITY
        } else {
            let Ok(raw) = fields[3].parse::<u64>() else {
                continue;
            };
            match kind {
                LimitKind::Stack => raw * 1024,
                _ => raw,
            }
        };

        limits.push((kind, value));
    }

    limits
}

fn default_limits() -> Vec<(LimitKind, u64)> {
    vec![
        (LimitKind::Nproc, DEFAULT_NPROC),
        (LimitKind::Nofile, DEFAULT_NOFILE),
        (LimitKind::Stack, DEFAULT_STACK_BYTES),
    ]
}

/// Apply process resource limits once at startup, reading overrides from
/// `conf_path` when it exists and falling back to built-in defaults. A limit
/// that cannot be applied is logged and skipped; the job proceeds regardless.
pub fn apply_resource_limits(conf_path: &Path) -> Result<()> {
    let limits = match std::fs::read_to_string(conf_path) {
        Ok(contents) => parse_limits_conf(&contents),
        Err(_) => default_limits(),
    };

    for (kind, value) in limits {
        crate::elog!("Setting resource {:?} to {}", kind, value);
        if let Err(e) = setrlimit(kind.as_resource(), value, value) {
            crate::elog!(
                "Warning: could not set resource {:?} to hard/soft limit {} (error={})",
                kind,
                value,
                e
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_limits_conf() {
        let conf = "\
# managed by provisioning
* soft nproc 16384
* hard nofile 65535
* hard stack 10240
root hard nofile 1048576
* hard core 0
";
        let limits = parse_limits_conf(conf);

        assert_eq!(
            limits,
            vec![
                (LimitKind::Nproc, 16_384),
                (LimitKind::Nofile, 65_535),
                (LimitKind::Stack, 10_240 * 1024),
            ]
        );
    }

    #[test]
    fn test_parse_limits_conf_unlimited() {
        let limits = parse_limits_conf("* hard stack unlimited\n");
        assert_eq!(limits, vec![(LimitKind::Stack, RLIM_INFINITY)]);
    }

    #[test]
    fn test_parse_limits_conf_ignores_garbage() {
        assert!(parse_limits_conf("nonsense line\n* hard nofile not-a-number\n").is_empty());
    }
}
