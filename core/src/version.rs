//! Version information for Replidoc
//!
//! Release metadata and replication protocol compatibility.

/// Replidoc version (semver format)
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Major version (breaking changes)
pub const VERSION_MAJOR: u32 = 0;

/// Minor version (new features)
pub const VERSION_MINOR: u32 = 1;

/// Replication protocol version (incremented on wire format changes)
pub const PROTOCOL_VERSION: u32 = 1;

/// Git commit hash (if available)
pub const GIT_HASH: Option<&str> = option_env!("GIT_HASH");

/// Build profile (debug/release)
pub const BUILD_PROFILE: &str = if cfg!(debug_assertions) {
    "debug"
} else {
    "release"
};

/// Full version string with metadata
pub fn version_string() -> String {
    let mut version = format!("Replidoc v{}", VERSION);

    if let Some(hash) = GIT_HASH {
        version.push_str(&format!(" ({})", &hash[..hash.len().min(8)]));
    }

    if BUILD_PROFILE == "debug" {
        version.push_str(" [debug]");
    }

    version
}

/// Check if a peer's replication protocol version is compatible
pub fn is_protocol_compatible(peer_protocol_version: u32) -> bool {
    // 0.x requires an exact match
    if VERSION_MAJOR == 0 {
        peer_protocol_version == PROTOCOL_VERSION
    } else {
        peer_protocol_version / 100 == PROTOCOL_VERSION / 100
    }
}
