//! Version information for clustershell.

/// Clustershell version from Cargo.toml
pub const CLUSTERSHELL_VERSION: &str = env!("CARGO_PKG_VERSION");
