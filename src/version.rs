//! Orchestrator version validation and upgrade path calculation.

use semver::Version;

use crate::error::{KruError, Result};

/// Versions the tool knows how to deploy. Overridable with `--supported-version`.
pub const KNOWN_VERSIONS: &[&str] = &[
    "1.22.15", "1.22.17", "1.23.5", "1.23.6", "1.23.12", "1.23.14", "1.24.0", "1.24.7", "1.24.9",
];

/// Parse a strict `X.Y.Z` version.
pub fn parse_version(version: &str) -> Result<Version> {
    Version::parse(version).map_err(|_| KruError::InvalidVersionFormat(version.to_string()))
}

/// Check that moving from `current` to `target` is permitted.
///
/// A malformed target is always rejected. `force` skips the supported-path
/// check entirely, so same-version refreshes and downgrades pass.
pub fn is_upgrade_allowed(
    current: &str,
    target: &str,
    supported_upgrades: &[String],
    force: bool,
) -> Result<()> {
    let target_version = parse_version(target)?;

    if force {
        return Ok(());
    }

    let supported = supported_upgrades
        .iter()
        .filter_map(|v| Version::parse(v).ok())
        .any(|v| v == target_version);

    if supported {
        Ok(())
    } else {
        Err(KruError::UnsupportedUpgradePath {
            current: current.to_string(),
            target: target.to_string(),
        })
    }
}

/// Versions reachable from `current`: newer, same major, at most one minor ahead.
///
/// Returned in ascending order. An unparsable `current` yields an empty list.
pub fn available_upgrades<S: AsRef<str>>(current: &str, catalog: &[S]) -> Vec<String> {
    let Ok(current) = Version::parse(current) else {
        return Vec::new();
    };

    let mut upgrades: Vec<Version> = catalog
        .iter()
        .filter_map(|v| Version::parse(v.as_ref()).ok())
        .filter(|v| v.major == current.major && v.minor <= current.minor + 1 && *v > current)
        .collect();

    upgrades.sort();
    upgrades.dedup();
    upgrades.iter().map(ToString::to_string).collect()
}
