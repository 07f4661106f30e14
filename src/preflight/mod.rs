//! Preflight checks run before touching the network or the mount table.
//!
//! Validates that the host has the tools the configured pipeline shells
//! out to, so a missing `gpg` is reported up front rather than after a
//! multi-gigabyte download.
//!
//! # Example
//!
//! ```rust
//! use distro_source::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("mount") {
//!     println!("util-linux not installed");
//! }
//!
//! let tools = &[("mount", "util-linux"), ("gpg", "gnupg")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};
use tracing::debug;

use crate::config::{Config, SyncMode};
use crate::process;

/// Tools every extraction needs. Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[("mount", "util-linux")];

/// Needed when signing keys are configured.
pub const SIGNATURE_TOOLS: &[(&str, &str)] = &[("gpg", "gnupg")];

/// Needed when `extract.sync = "rsync"`.
pub const RSYNC_TOOLS: &[(&str, &str)] = &[("rsync", "rsync")];

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    process::exists(cmd)
}

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Tools the pipeline described by `config` will invoke.
pub fn tools_for(config: &Config) -> Vec<(&'static str, &'static str)> {
    let mut tools = REQUIRED_TOOLS.to_vec();
    let policy = config.policy();
    if !policy.skip_verification && !policy.keyring.is_empty() {
        tools.extend_from_slice(SIGNATURE_TOOLS);
    }
    if config.sync == SyncMode::Rsync {
        tools.extend_from_slice(RSYNC_TOOLS);
    }
    tools
}

/// Check everything [`tools_for`] lists.
pub fn check_config(config: &Config) -> Result<()> {
    let tools = tools_for(config);
    debug!(tools = ?tools, "preflight");
    check_required_tools(&tools)
}
