//! Protocol version negotiation
//!
//! Clients and servers must agree on `major.minor`; the client must also be
//! at or above the server's minimum. `buildId` equality is enforced only
//! between server builds (prefix `node_`); browser builds (prefix `build_`)
//! rely on bundler content-hashing for cache busting and are exempt.

use crate::error::MeshError;
use rand::RngCore;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Version this build speaks.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Oldest client version the bootstrap contract accepts.
pub const MIN_COMPATIBLE_VERSION: &str = "1.0.0";

/// Build-id prefix for server builds.
pub const BUILD_ID_NODE_PREFIX: &str = "node_";

/// Build-id prefix for browser bundles.
pub const BUILD_ID_BROWSER_PREFIX: &str = "build_";

/// A semver-shaped protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    pub fn current() -> Self {
        PROTOCOL_VERSION
            .parse()
            .unwrap_or(ProtocolVersion {
                major: 1,
                minor: 0,
                patch: 0,
            })
    }

    /// Compatibility rule: equal `major.minor`, and the client at or above
    /// `minimum`.
    pub fn compatible_with(&self, server: &ProtocolVersion, minimum: &ProtocolVersion) -> bool {
        self.major == server.major && self.minor == server.minor && *self >= *minimum
    }
}

impl PartialOrd for ProtocolVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProtocolVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ProtocolVersion {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let mut next = || -> Result<u32, MeshError> {
            parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| MeshError::MalformedJson(format!("bad version string {s:?}")))
        };
        let version = ProtocolVersion {
            major: next()?,
            minor: next()?,
            patch: next()?,
        };
        if parts.next().is_some() {
            return Err(MeshError::MalformedJson(format!("bad version string {s:?}")));
        }
        Ok(version)
    }
}

/// Generate a fresh server build id.
pub fn new_build_id() -> String {
    let mut raw = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    format!("{}{}", BUILD_ID_NODE_PREFIX, hex::encode(raw))
}

/// Whether two peers' build ids must match: only when both are server
/// builds. Browser bundles are exempt.
pub fn build_ids_must_match(local: &str, remote: &str) -> bool {
    local.starts_with(BUILD_ID_NODE_PREFIX) && remote.starts_with(BUILD_ID_NODE_PREFIX)
}

/// Server-to-server build check across rolling deploys: mismatch refuses
/// the connection.
pub fn build_ids_compatible(local: &str, remote: &str) -> bool {
    !build_ids_must_match(local, remote) || local == remote
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> ProtocolVersion {
        s.parse().unwrap()
    }

    #[test]
    fn parse_and_display_round_trip() {
        let version = v("1.2.3");
        assert_eq!(version.major, 1);
        assert_eq!(version.minor, 2);
        assert_eq!(version.patch, 3);
        assert_eq!(version.to_string(), "1.2.3");

        assert!("1.2".parse::<ProtocolVersion>().is_err());
        assert!("1.2.x".parse::<ProtocolVersion>().is_err());
        assert!("1.2.3.4".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn compatibility_requires_equal_major_minor() {
        let minimum = v("1.0.0");
        assert!(v("1.0.5").compatible_with(&v("1.0.0"), &minimum));
        assert!(!v("1.1.0").compatible_with(&v("1.0.0"), &minimum));
        assert!(!v("2.0.0").compatible_with(&v("1.0.0"), &minimum));
    }

    #[test]
    fn compatibility_enforces_the_minimum() {
        // The §8 scenario: a 0.9.0 client against a 1.0.0 server with
        // minimum 1.0.0 is refused.
        assert!(!v("0.9.0").compatible_with(&v("1.0.0"), &v("1.0.0")));
    }

    #[test]
    fn build_id_rule_exempts_browsers() {
        assert!(build_ids_compatible("node_aa", "node_aa"));
        assert!(!build_ids_compatible("node_aa", "node_bb"));
        assert!(build_ids_compatible("build_aa", "node_bb"));
        assert!(build_ids_compatible("build_aa", "build_bb"));
    }

    #[test]
    fn new_build_ids_are_server_prefixed_and_unique() {
        let a = new_build_id();
        let b = new_build_id();
        assert!(a.starts_with(BUILD_ID_NODE_PREFIX));
        assert_ne!(a, b);
    }
}
