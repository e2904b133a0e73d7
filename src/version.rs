use std::fmt;

use crate::error::{ClientError, ClientResult};

/// Oldest api version a loaded client library may be driven at.
pub const MIN_SUPPORTED_API_VERSION: i32 = 500;

/// Api version this facade was built against. Also used as the header
/// version handed to loaded libraries in `select_api_version`.
pub const MAX_SUPPORTED_API_VERSION: i32 = 700;

/// First api version whose clients create databases with a single call
/// instead of the legacy cluster handshake.
pub const DIRECT_DATABASE_API_VERSION: i32 = 610;

/// The wire protocol version announced by a cluster.
///
/// The value is opaque except for the compatibility mask: two versions that
/// agree on everything above the low 16 bits can serve each other's traffic,
/// so client selection always compares [`ProtocolVersion::normalized`] forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(pub u64);

const PROTOCOL_MAGIC: u64 = 0x0DBC_0B00_0000_0000;
const COMPATIBLE_MASK: u64 = 0xFFFF_FFFF_FFFF_0000;

impl ProtocolVersion {
    pub const V5_0: ProtocolVersion = ProtocolVersion::for_release(5, 0);
    pub const V6_0: ProtocolVersion = ProtocolVersion::for_release(6, 0);
    pub const V6_1: ProtocolVersion = ProtocolVersion::for_release(6, 1);
    pub const V6_2: ProtocolVersion = ProtocolVersion::for_release(6, 2);
    pub const V6_3: ProtocolVersion = ProtocolVersion::for_release(6, 3);
    pub const V7_0: ProtocolVersion = ProtocolVersion::for_release(7, 0);

    /// Protocol version introduced by a `major.minor` release line.
    pub const fn for_release(major: u8, minor: u8) -> ProtocolVersion {
        ProtocolVersion(PROTOCOL_MAGIC | ((major as u64) << 32) | ((minor as u64) << 24))
    }

    /// Collapse compatibility-equivalent versions to one canonical value.
    pub const fn normalized(self) -> ProtocolVersion {
        ProtocolVersion(self.0 & COMPATIBLE_MASK)
    }

    /// Whether clients at this version can answer a server-protocol query
    /// from the connect packet. Releases up to and including 5.0 cannot and
    /// need a GRV probe instead.
    pub const fn supports_protocol_query(self) -> bool {
        self.normalized().0 > Self::V5_0.normalized().0
    }

    /// Database connections older than 6.1 misbehave when closed, so the
    /// facade keeps them open for the life of the process.
    pub const fn benefits_from_close(self) -> bool {
        self.normalized().0 >= Self::V6_1.normalized().0
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Parse the protocol version out of a client version string.
///
/// Every client release reports `"<semver>,<source-id>,<protocol-hex>"`; the
/// third comma-separated field is the protocol version in hex.
pub fn protocol_version_from_client_version(version: &str) -> ClientResult<ProtocolVersion> {
    let field = version
        .split(',')
        .nth(2)
        .ok_or_else(|| ClientError::InvalidClientVersion(version.to_string()))?;
    u64::from_str_radix(field.trim(), 16)
        .map(ProtocolVersion)
        .map_err(|_| ClientError::InvalidClientVersion(version.to_string()))
}

/// Render a client version string in the shape
/// [`protocol_version_from_client_version`] parses.
pub fn format_client_version(semver: &str, source: &str, protocol: ProtocolVersion) -> String {
    format!("{},{},{:016x}", semver, source, protocol.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_collapses_patch_bits() {
        let a = ProtocolVersion(ProtocolVersion::V6_2.0 | 0x0001);
        let b = ProtocolVersion(ProtocolVersion::V6_2.0 | 0x00ff);
        assert_ne!(a, b);
        assert_eq!(a.normalized(), b.normalized());
        assert_ne!(
            ProtocolVersion::V6_2.normalized(),
            ProtocolVersion::V6_3.normalized()
        );
    }

    #[test]
    fn capability_thresholds() {
        assert!(!ProtocolVersion::V5_0.supports_protocol_query());
        assert!(ProtocolVersion::V6_0.supports_protocol_query());
        assert!(!ProtocolVersion::V6_0.benefits_from_close());
        assert!(ProtocolVersion::V6_1.benefits_from_close());
        assert!(ProtocolVersion::V7_0.benefits_from_close());
    }

    #[test]
    fn client_version_string_round_trip() {
        let rendered = format_client_version("6.2.15", "a1b2c3d4", ProtocolVersion::V6_2);
        let parsed = protocol_version_from_client_version(&rendered).unwrap();
        assert_eq!(parsed, ProtocolVersion::V6_2);
    }

    #[test]
    fn malformed_client_version_strings_are_rejected() {
        assert!(protocol_version_from_client_version("6.2.15").is_err());
        assert!(protocol_version_from_client_version("6.2.15,src,notahex!").is_err());
    }
}
