//! Core configuration.
//!
//! Values come from [`CoreConfig::default`], optionally overridden by
//! `PATCHLOOP_*` environment variables and then by CLI flags. A configuration
//! that fails [`CoreConfig::validate`] is rejected at startup.

use std::time::Duration;

use crate::error::ConfigError;
use crate::project::DEFAULT_STATE_DIR;
use crate::tools::Mode;

pub const ENV_MAX_ITERATIONS: &str = "PATCHLOOP_MAX_ITERATIONS";
pub const ENV_MAX_VERIFY_ITERATIONS: &str = "PATCHLOOP_MAX_VERIFY_ITERATIONS";
pub const ENV_SHELL_TIMEOUT_SECS: &str = "PATCHLOOP_SHELL_TIMEOUT_SECS";
pub const ENV_OUTPUT_LIMIT_BYTES: &str = "PATCHLOOP_OUTPUT_LIMIT_BYTES";
pub const ENV_VERIFY_ALLOWLIST: &str = "PATCHLOOP_VERIFY_ALLOWLIST";
pub const ENV_DEFAULT_MODE: &str = "PATCHLOOP_DEFAULT_MODE";

/// Default shell timeout (2 minutes).
pub const DEFAULT_SHELL_TIMEOUT_SECS: u64 = 120;

/// Default cap on captured stdout/stderr per stream.
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 256 * 1024;

/// Default command prefixes permitted during the verify phase.
pub const DEFAULT_VERIFY_ALLOWLIST: &[&str] = &[
    "cargo build",
    "cargo check",
    "cargo test",
    "cargo clippy",
    "git diff",
    "git status",
];

#[derive(Debug, Clone, PartialEq)]
pub struct CoreConfig {
    /// Name of the state directory under the project root
    pub state_dir_name: String,
    /// Wall-clock limit for one shell command
    pub shell_timeout: Duration,
    /// Bytes of stdout and of stderr kept per command
    pub output_limit_bytes: usize,
    /// Model calls allowed in the primary phase
    pub max_iterations: usize,
    /// Tool-execution rounds allowed in the verify phase (0 disables it)
    pub max_verify_iterations: usize,
    /// Command prefixes the verify-phase shell accepts
    pub verify_allowlist: Vec<String>,
    /// Reject `;`, `&&`, `|`, substitutions and newlines in verify commands
    pub deny_command_chaining: bool,
    /// Mode used when a mutating call has no `mode` argument
    pub default_mode: Mode,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            state_dir_name: DEFAULT_STATE_DIR.to_string(),
            shell_timeout: Duration::from_secs(DEFAULT_SHELL_TIMEOUT_SECS),
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            max_iterations: 25,
            max_verify_iterations: 3,
            verify_allowlist: DEFAULT_VERIFY_ALLOWLIST
                .iter()
                .map(|p| p.to_string())
                .collect(),
            deny_command_chaining: true,
            default_mode: Mode::Apply,
        }
    }
}

impl CoreConfig {
    /// Defaults overridden by `PATCHLOOP_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`CoreConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_MAX_ITERATIONS) {
            config.max_iterations = parse_number(ENV_MAX_ITERATIONS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_VERIFY_ITERATIONS) {
            config.max_verify_iterations = parse_number(ENV_MAX_VERIFY_ITERATIONS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_SHELL_TIMEOUT_SECS) {
            config.shell_timeout =
                Duration::from_secs(parse_number(ENV_SHELL_TIMEOUT_SECS, &raw)? as u64);
        }
        if let Some(raw) = lookup(ENV_OUTPUT_LIMIT_BYTES) {
            config.output_limit_bytes = parse_number(ENV_OUTPUT_LIMIT_BYTES, &raw)?;
        }
        if let Some(raw) = lookup(ENV_VERIFY_ALLOWLIST) {
            config.verify_allowlist = parse_allowlist(&raw);
        }
        if let Some(raw) = lookup(ENV_DEFAULT_MODE) {
            config.default_mode = raw
                .parse()
                .map_err(|reason: String| ConfigError::invalid(ENV_DEFAULT_MODE, reason))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check invariants. Called once at startup; failures are fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let state_dir = std::path::Path::new(&self.state_dir_name);
        let single_component = state_dir.components().count() == 1
            && matches!(
                state_dir.components().next(),
                Some(std::path::Component::Normal(_))
            );
        if !single_component {
            return Err(ConfigError::invalid(
                "state_dir_name",
                "must be a single directory name",
            ));
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::invalid("max_iterations", "must be at least 1"));
        }
        if self.shell_timeout.is_zero() {
            return Err(ConfigError::invalid("shell_timeout", "must be non-zero"));
        }
        if self.output_limit_bytes == 0 {
            return Err(ConfigError::invalid(
                "output_limit_bytes",
                "must be non-zero",
            ));
        }
        if let Some(blank) = self.verify_allowlist.iter().find(|p| p.trim().is_empty()) {
            return Err(ConfigError::invalid(
                "verify_allowlist",
                format!("prefix {:?} is blank and would allow every command", blank),
            ));
        }
        if self.max_verify_iterations > 0 && self.verify_allowlist.is_empty() {
            return Err(ConfigError::invalid(
                "verify_allowlist",
                "must list at least one prefix when the verify phase is enabled",
            ));
        }
        Ok(())
    }
}

fn parse_number(field: &str, raw: &str) -> Result<usize, ConfigError> {
    raw.trim()
        .parse::<usize>()
        .map_err(|e| ConfigError::invalid(field, format!("{:?} is not a number: {}", raw, e)))
}

/// Split a comma-separated allowlist. Leading whitespace is dropped but a
/// trailing space is kept, so `"make ,cargo test"` yields `"make "`.
fn parse_allowlist(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|p| p.trim_start().to_string())
        .filter(|p| !p.trim().is_empty())
        .collect()
}
