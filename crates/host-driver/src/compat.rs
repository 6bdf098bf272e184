//! Minimum Docker and kernel versions

use crate::error::HostError;
use crate::models::DockerInfo;
use semver::Version;

/// Oldest Docker server accepted
pub const MIN_DOCKER_VERSION: Version = Version::new(1, 13, 0);
/// Oldest kernel accepted
pub const MIN_KERNEL_VERSION: Version = Version::new(3, 10, 0);

/// Loose version parse: `17.03.2-ce`, `24.0.7+dfsg1`, `5.15.0-91-generic`
///
/// Leading zeros and vendor suffixes are tolerated; missing components are 0.
#[must_use]
pub fn parse_loose_version(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches('v');
    let numeric: String = raw
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = numeric.split('.').filter(|p| !p.is_empty()).map(str::parse::<u64>);
    let major = parts.next()?.ok()?;
    let minor = parts.next().and_then(Result::ok).unwrap_or(0);
    let patch = parts.next().and_then(Result::ok).unwrap_or(0);
    Some(Version::new(major, minor, patch))
}

/// Reject hosts below the minimum Docker or kernel version
///
/// # Errors
///
/// Returns `HostError::Incompatible` naming the failed check.
pub fn check_compatibility(
    host: &str,
    info: &DockerInfo,
    kernel_version: &str,
    ignore_docker_version: bool,
) -> Result<(), HostError> {
    if !ignore_docker_version {
        match parse_loose_version(&info.server_version) {
            Some(v) if v >= MIN_DOCKER_VERSION => {}
            _ => {
                return Err(HostError::Incompatible {
                    host: host.to_string(),
                    reason: format!(
                        "Docker version {} is not supported, minimum is {MIN_DOCKER_VERSION}",
                        info.server_version
                    ),
                });
            }
        }
    }

    let kernel = if kernel_version.trim().is_empty() {
        &info.kernel_version
    } else {
        kernel_version
    };
    match parse_loose_version(kernel) {
        Some(v) if v >= MIN_KERNEL_VERSION => Ok(()),
        _ => Err(HostError::Incompatible {
            host: host.to_string(),
            reason: format!("kernel version {kernel} is not supported, minimum is {MIN_KERNEL_VERSION}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(version: &str) -> DockerInfo {
        DockerInfo {
            server_version: version.to_string(),
            kernel_version: "5.15.0-91-generic".to_string(),
            operating_system: "Ubuntu 22.04".to_string(),
        }
    }

    #[test]
    fn test_parse_loose_versions() {
        assert_eq!(parse_loose_version("17.03.2-ce"), Some(Version::new(17, 3, 2)));
        assert_eq!(parse_loose_version("24.0.7+dfsg1"), Some(Version::new(24, 0, 7)));
        assert_eq!(parse_loose_version("5.15.0-91-generic"), Some(Version::new(5, 15, 0)));
        assert_eq!(parse_loose_version("1.13"), Some(Version::new(1, 13, 0)));
        assert_eq!(parse_loose_version("garbage"), None);
    }

    #[test]
    fn test_old_docker_is_rejected() {
        let err = check_compatibility("10.0.0.1", &info("1.12.6"), "", false).unwrap_err();
        assert!(matches!(err, HostError::Incompatible { .. }));
    }

    #[test]
    fn test_old_docker_is_accepted_when_ignored() {
        assert!(check_compatibility("10.0.0.1", &info("1.12.6"), "", true).is_ok());
    }

    #[test]
    fn test_old_kernel_is_rejected() {
        let err = check_compatibility("10.0.0.1", &info("24.0.7"), "3.2.0-4-amd64", false).unwrap_err();
        assert!(err.to_string().contains("kernel version 3.2.0-4-amd64"));
    }
}
