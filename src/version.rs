//! Protocol version selection and feature gating.
//!
//! Server command-line flags vary by protocol version; each flag addition is
//! gated on one of the constants below before being appended.

use std::fmt;
use std::str::FromStr;

/// A dotted protocol version, totally ordered so gate checks read as
/// `version >= ProtocolVersion::V340`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Gate: per-project-root inferred projects.
    pub const V250: Self = Self::new(2, 5, 0);
    /// Gate: `--locale` flag.
    pub const V260: Self = Self::new(2, 6, 0);
    /// Gate: `--noGetErrOnBackgroundUpdate` flag.
    pub const V291: Self = Self::new(2, 9, 1);
    /// Gate: project-loading progress events.
    pub const V300: Self = Self::new(3, 0, 0);
    /// Gate: dedicated syntax server support.
    pub const V340: Self = Self::new(3, 4, 0);
    /// Gate: `--validateDefaultNpmLocation` flag.
    pub const V345: Self = Self::new(3, 4, 5);

    /// Version assumed when the server binary's version cannot be determined.
    pub const DEFAULT: Self = Self::new(3, 8, 0);
}

impl FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '.');
        let mut next = |name: &str| -> Result<u32, String> {
            parts
                .next()
                .unwrap_or("0")
                .parse()
                .map_err(|_| format!("invalid {} in version string '{}'", name, s))
        };
        let major = next("major")?;
        let minor = next("minor")?;
        // Patch may carry a prerelease suffix ("3.9.0-beta"); ignore it.
        let patch = match parts.next() {
            Some(rest) => rest
                .split(['-', '+'])
                .next()
                .unwrap_or("0")
                .parse()
                .map_err(|_| format!("invalid patch in version string '{}'", s))?,
            None => 0,
        };
        Ok(Self { major, minor, patch })
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
