//! Prefix allowlist for the shell tool.
//!
//! The verify phase hands the model a shell that only runs commands starting
//! with an approved prefix. Prefixes are matched verbatim, so a trailing space
//! in `"xcodebuild "` stops `"xcodebuildx"` from passing.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::{ProgressSink, Tool, ToolArguments, ToolContext, ToolOutput};
use crate::error::{ConfigError, ToolError};
use crate::scheduler::keys::AccessRule;

/// Shell operators that would let an allowlisted prefix smuggle in a second
/// command.
const CHAINING_TOKENS: &[(&str, &str)] = &[
    ("&&", "'&&'"),
    ("||", "'||'"),
    (";", "';'"),
    ("|", "'|'"),
    ("`", "backticks"),
    ("$(", "'$('"),
    ("\n", "newlines"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandAllowlist {
    prefixes: Vec<String>,
    deny_chaining: bool,
}

impl CommandAllowlist {
    pub fn new(prefixes: Vec<String>) -> Result<Self, ConfigError> {
        if let Some(blank) = prefixes.iter().find(|p| p.trim().is_empty()) {
            return Err(ConfigError::invalid(
                "verify_allowlist",
                format!("blank prefix {:?} would allow every command", blank),
            ));
        }
        Ok(Self {
            prefixes,
            deny_chaining: true,
        })
    }

    pub fn with_chaining_denied(mut self, deny: bool) -> Self {
        self.deny_chaining = deny;
        self
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    /// Trimmed command if it passes, otherwise a `NotAllowlisted` error.
    pub fn check(&self, command: &str) -> Result<String, ToolError> {
        let trimmed = command.trim();
        let rejected = |detail: Option<String>| ToolError::NotAllowlisted {
            command: trimmed.to_string(),
            allowed: self.prefixes.clone(),
            detail,
        };

        if !self.prefixes.iter().any(|p| trimmed.starts_with(p.as_str())) {
            return Err(rejected(None));
        }
        if self.deny_chaining {
            if let Some((_, label)) = CHAINING_TOKENS.iter().find(|(t, _)| trimmed.contains(t)) {
                return Err(rejected(Some(format!("command chaining with {} is not allowed", label))));
            }
        }
        Ok(trimmed.to_string())
    }
}

/// Shell tool behind a [`CommandAllowlist`]. Same name and schema as the
/// wrapped tool, so the model sees no difference until a command is refused.
pub struct AllowlistedShell {
    inner: Arc<dyn Tool>,
    allowlist: CommandAllowlist,
}

impl AllowlistedShell {
    pub fn new(inner: Arc<dyn Tool>, allowlist: CommandAllowlist) -> Self {
        Self { inner, allowlist }
    }

    fn guarded_arguments(&self, args: &ToolArguments) -> Result<ToolArguments, ToolError> {
        let command = args.require_str("command")?;
        let approved = self.allowlist.check(command).map_err(|e| {
            warn!("🚫 Refused command in verify phase: {}", command.trim());
            e
        })?;

        let mut forwarded = args.clone();
        forwarded.insert("command", Value::String(approved));
        Ok(forwarded)
    }
}

#[async_trait]
impl Tool for AllowlistedShell {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn parameters(&self) -> Value {
        self.inner.parameters()
    }

    fn access(&self) -> AccessRule {
        self.inner.access()
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        args: &ToolArguments,
    ) -> Result<ToolOutput, ToolError> {
        let forwarded = self.guarded_arguments(args)?;
        self.inner.execute(ctx, &forwarded).await
    }

    async fn execute_streaming(
        &self,
        ctx: &ToolContext,
        args: &ToolArguments,
        progress: &dyn ProgressSink,
    ) -> Result<ToolOutput, ToolError> {
        let forwarded = self.guarded_arguments(args)?;
        self.inner.execute_streaming(ctx, &forwarded, progress).await
    }
}
