//! Tool boundary: calls, arguments, the [`Tool`] trait and the registry.
//!
//! A tool declares how it touches the project through [`Tool::access`]; the
//! scheduler turns that declaration into resource keys. Tools never return
//! errors to the caller of a batch: failures are rendered into the tool
//! result the model sees.

pub mod allowlist;
pub mod file_tools;
pub mod shell;
pub mod types;

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::{RegistryError, ToolError};
use crate::events::FileEvent;
use crate::scheduler::keys::AccessRule;
use crate::services::ProjectServices;

pub use allowlist::{AllowlistedShell, CommandAllowlist};
pub use shell::ShellTool;

/// Namespace for conversation-scoped patch set ids.
const PATCHLOOP_NAMESPACE: Uuid = Uuid::from_bytes([
    0x3f, 0x1c, 0x8e, 0x52, 0x7a, 0x0b, 0x4d, 0x6e, 0x9c, 0x21, 0x5b, 0xd4, 0x02, 0xe7, 0x91, 0xa8,
]);

/// Name of the shell tool wrapped by the allowlist in the verify phase.
pub const RUN_COMMAND: &str = "run_command";

/// Tool call arguments: a JSON object with coercion helpers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolArguments(Map<String, Value>);

impl ToolArguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    /// String argument that must be present and non-empty.
    pub fn require_str(&self, name: &str) -> Result<&str, ToolError> {
        match self.0.get(name) {
            None | Some(Value::Null) => Err(ToolError::missing(name)),
            Some(Value::String(s)) if s.trim().is_empty() => {
                Err(ToolError::invalid(name, "must not be empty"))
            }
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(ToolError::invalid(
                name,
                format!("expected a string, got {}", type_name(other)),
            )),
        }
    }

    /// String argument that must be present; empty is allowed.
    pub fn require_text(&self, name: &str) -> Result<&str, ToolError> {
        match self.0.get(name) {
            None | Some(Value::Null) => Err(ToolError::missing(name)),
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(ToolError::invalid(
                name,
                format!("expected a string, got {}", type_name(other)),
            )),
        }
    }

    /// Boolean argument. Accepts `true`/`false` and their string spellings.
    pub fn bool(&self, name: &str) -> Result<Option<bool>, ToolError> {
        match self.0.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Some(true)),
                "false" => Ok(Some(false)),
                _ => Err(ToolError::invalid(
                    name,
                    format!("expected true or false, got {:?}", s),
                )),
            },
            Some(other) => Err(ToolError::invalid(
                name,
                format!("expected a boolean, got {}", type_name(other)),
            )),
        }
    }

    /// Non-negative integer argument. Accepts numeric strings.
    pub fn u64(&self, name: &str) -> Result<Option<u64>, ToolError> {
        match self.0.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
                ToolError::invalid(name, format!("expected a non-negative integer, got {}", n))
            }),
            Some(Value::String(s)) => s.trim().parse::<u64>().map(Some).map_err(|_| {
                ToolError::invalid(name, format!("expected a non-negative integer, got {:?}", s))
            }),
            Some(other) => Err(ToolError::invalid(
                name,
                format!("expected a non-negative integer, got {}", type_name(other)),
            )),
        }
    }

    pub fn array(&self, name: &str) -> Option<&Vec<Value>> {
        self.0.get(name).and_then(Value::as_array)
    }

    /// Deserialize the whole argument object into a typed struct.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ToolError> {
        serde_json::from_value(Value::Object(self.0.clone())).map_err(|e| {
            let message = e.to_string();
            match missing_field(&message) {
                Some(field) => ToolError::missing(field),
                None => ToolError::invalid("arguments", message),
            }
        })
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for ToolArguments {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Lenient conversion from whatever a model produced.
///
/// Objects are taken as-is, a string holding a JSON object is decoded, and
/// anything else becomes an empty argument set (tools then report the
/// missing arguments by name).
impl From<Value> for ToolArguments {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => Self(map),
                _ => {
                    debug!("Ignoring non-object tool arguments: {:?}", raw);
                    Self::default()
                }
            },
            Value::Null => Self::default(),
            other => {
                debug!("Ignoring non-object tool arguments: {}", other);
                Self::default()
            }
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Pull `x` out of serde's "missing field `x`" message.
fn missing_field(message: &str) -> Option<String> {
    let rest = message.strip_prefix("missing field `")?;
    let end = rest.find('`')?;
    Some(rest[..end].to_string())
}

fn new_call_id() -> String {
    Uuid::new_v4().to_string()
}

/// One model-issued tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default = "new_call_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: ToolArguments,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: impl Into<ToolArguments>) -> Self {
        Self {
            id: new_call_id(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// How mutating tools treat the disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Write through to disk behind a checkpoint
    #[default]
    Apply,
    /// Stage into a patch set without touching the project files
    Propose,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Apply => "apply",
            Mode::Propose => "propose",
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "apply" => Ok(Mode::Apply),
            "propose" => Ok(Mode::Propose),
            other => Err(format!("expected 'apply' or 'propose', got {:?}", other)),
        }
    }
}

/// Per-conversation defaults used when a call omits `mode` or `patch_set_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationDefaults {
    pub mode: Mode,
    pub conversation_id: String,
}

impl Default for InvocationDefaults {
    fn default() -> Self {
        Self {
            mode: Mode::Apply,
            conversation_id: Uuid::new_v4().to_string(),
        }
    }
}

impl InvocationDefaults {
    pub fn new(mode: Mode, conversation_id: impl Into<String>) -> Self {
        Self {
            mode,
            conversation_id: conversation_id.into(),
        }
    }

    /// Deterministic patch set id for the conversation.
    pub fn default_patch_set_id(&self) -> String {
        format!(
            "conv-{}",
            Uuid::new_v5(&PATCHLOOP_NAMESPACE, self.conversation_id.as_bytes())
        )
    }
}

/// Per-call values computed from the call and the conversation defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocationContext {
    pub tool_call_id: String,
    pub mode: Mode,
    pub patch_set_id: String,
}

impl ToolInvocationContext {
    pub fn from_call(call: &ToolCall, defaults: &InvocationDefaults) -> Result<Self, ToolError> {
        let mode = match call.arguments.get("mode") {
            None | Some(Value::Null) => defaults.mode,
            Some(Value::String(raw)) => raw
                .parse()
                .map_err(|reason: String| ToolError::invalid("mode", reason))?,
            Some(other) => {
                return Err(ToolError::invalid(
                    "mode",
                    format!("expected 'apply' or 'propose', got {}", type_name(other)),
                ))
            }
        };
        let patch_set_id = match call.arguments.get("patch_set_id") {
            None | Some(Value::Null) => defaults.default_patch_set_id(),
            Some(Value::String(id)) if !id.trim().is_empty() => id.trim().to_string(),
            Some(_) => {
                return Err(ToolError::invalid(
                    "patch_set_id",
                    "expected a non-empty string",
                ))
            }
        };
        Ok(Self {
            tool_call_id: call.id.clone(),
            mode,
            patch_set_id,
        })
    }
}

/// Name, description and JSON schema advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// JSON schema for an argument struct.
pub fn schema_for<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T))
        .unwrap_or_else(|_| serde_json::json!({ "type": "object" }))
}

/// Everything a tool gets besides its arguments.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub invocation: ToolInvocationContext,
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn call_id(&self) -> &str {
        &self.invocation.tool_call_id
    }
}

/// Receiver of incremental tool output (e.g. shell lines).
pub trait ProgressSink: Send + Sync {
    fn report(&self, tool_call_id: &str, chunk: &str);
}

/// Successful tool result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
    /// Files changed on disk by this call.
    pub changes: Vec<FileEvent>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            changes: Vec::new(),
        }
    }

    pub fn with_changes(mut self, changes: Vec<FileEvent>) -> Self {
        self.changes = changes;
        self
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the argument object.
    fn parameters(&self) -> Value;

    /// How the call touches the project. Unknown tools are exclusive.
    fn access(&self) -> AccessRule {
        AccessRule::Exclusive
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: &ToolArguments)
        -> Result<ToolOutput, ToolError>;

    /// Variant that may report partial output while running.
    async fn execute_streaming(
        &self,
        ctx: &ToolContext,
        args: &ToolArguments,
        _progress: &dyn ProgressSink,
    ) -> Result<ToolOutput, ToolError> {
        self.execute(ctx, args).await
    }
}

/// Tools by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. Registering a name twice is an error.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(RegistryError::DuplicateTool(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Tool>> {
        self.tools.values()
    }
}

/// Every built-in tool bound to one project.
pub fn builtin_registry(services: &Arc<ProjectServices>) -> Result<ToolRegistry, RegistryError> {
    use file_tools::*;

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ReadFileTool::new(services.clone())))?;
    registry.register(Arc::new(ListFilesTool::new(services.clone())))?;
    registry.register(Arc::new(SearchFilesTool::new(services.clone())))?;
    registry.register(Arc::new(WriteFileTool::new(services.clone())))?;
    registry.register(Arc::new(CreateFileTool::new(services.clone())))?;
    registry.register(Arc::new(DeleteFileTool::new(services.clone())))?;
    registry.register(Arc::new(ReplaceInFileTool::new(services.clone())))?;
    registry.register(Arc::new(BatchWriteTool::new(services.clone())))?;
    registry.register(Arc::new(ShowPatchSetTool::new(services.clone())))?;
    registry.register(Arc::new(ApplyPatchSetTool::new(services.clone())))?;
    registry.register(Arc::new(ClearPatchSetTool::new(services.clone())))?;
    registry.register(Arc::new(RestoreCheckpointTool::new(services.clone())))?;
    registry.register(Arc::new(ShellTool::new(
        services.project.root().to_path_buf(),
        services.config.shell_timeout,
        services.config.output_limit_bytes,
    )))?;
    Ok(registry)
}

/// Reduced tool set for the verify phase: every read-only tool plus the
/// shell wrapped in `allowlist`.
pub fn verify_registry(
    full: &ToolRegistry,
    allowlist: CommandAllowlist,
) -> Result<ToolRegistry, RegistryError> {
    let shell = full
        .get(RUN_COMMAND)
        .ok_or_else(|| RegistryError::MissingTool(RUN_COMMAND.to_string()))?;

    let mut verify = ToolRegistry::new();
    for tool in full.iter() {
        if tool.access() == AccessRule::ReadOnly {
            verify.register(tool.clone())?;
        }
    }
    verify.register(Arc::new(AllowlistedShell::new(shell, allowlist)))?;
    Ok(verify)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Named(&'static str);

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "test tool"
        }
        fn parameters(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(
            &self,
            _ctx: &ToolContext,
            _args: &ToolArguments,
        ) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::text(self.0))
        }
    }

    #[test]
    fn test_argument_coercion() {
        let args = ToolArguments::from(json!({
            "path": "a.txt",
            "flag": "true",
            "count": "12",
            "number": 7,
            "blank": "  ",
        }));

        assert_eq!(args.require_str("path").unwrap(), "a.txt");
        assert_eq!(args.bool("flag").unwrap(), Some(true));
        assert_eq!(args.u64("count").unwrap(), Some(12));
        assert_eq!(args.u64("number").unwrap(), Some(7));
        assert_eq!(args.bool("absent").unwrap(), None);

        assert!(matches!(
            args.require_str("missing"),
            Err(ToolError::MissingArgument { .. })
        ));
        assert!(matches!(
            args.require_str("blank"),
            Err(ToolError::InvalidArgument { .. })
        ));
        assert!(matches!(
            args.require_str("number"),
            Err(ToolError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_arguments_from_stringified_json() {
        let args = ToolArguments::from(Value::String(r#"{"path":"x.rs"}"#.to_string()));
        assert_eq!(args.str("path"), Some("x.rs"));

        let args = ToolArguments::from(json!([1, 2]));
        assert!(args.as_map().is_empty());
    }

    #[test]
    fn test_parse_reports_missing_field_by_name() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Args {
            path: String,
        }

        let err = ToolArguments::new().parse::<Args>().unwrap_err();
        assert_eq!(err.to_string(), "Missing required argument 'path'");
    }

    #[test]
    fn test_invocation_context_defaults() {
        let defaults = InvocationDefaults::new(Mode::Apply, "conversation-1");
        let call = ToolCall::new("write_file", json!({ "path": "a" })).with_id("c1");

        let ctx = ToolInvocationContext::from_call(&call, &defaults).unwrap();
        assert_eq!(ctx.mode, Mode::Apply);
        assert_eq!(ctx.tool_call_id, "c1");
        assert!(ctx.patch_set_id.starts_with("conv-"));
        assert_eq!(ctx.patch_set_id, defaults.default_patch_set_id());
    }

    #[test]
    fn test_invocation_context_overrides_and_rejects() {
        let defaults = InvocationDefaults::new(Mode::Apply, "conversation-1");
        let call = ToolCall::new(
            "write_file",
            json!({ "mode": "propose", "patch_set_id": "feature-x" }),
        );
        let ctx = ToolInvocationContext::from_call(&call, &defaults).unwrap();
        assert_eq!(ctx.mode, Mode::Propose);
        assert_eq!(ctx.patch_set_id, "feature-x");

        let bad = ToolCall::new("write_file", json!({ "mode": "yolo" }));
        let err = ToolInvocationContext::from_call(&bad, &defaults).unwrap_err();
        assert!(err.to_string().contains("'apply' or 'propose'"));
    }

    #[test]
    fn test_default_patch_set_id_is_stable_per_conversation() {
        let a = InvocationDefaults::new(Mode::Apply, "one");
        let b = InvocationDefaults::new(Mode::Propose, "one");
        let c = InvocationDefaults::new(Mode::Apply, "two");
        assert_eq!(a.default_patch_set_id(), b.default_patch_set_id());
        assert_ne!(a.default_patch_set_id(), c.default_patch_set_id());
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Named("a"))).unwrap();
        let err = registry.register(Arc::new(Named("a"))).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateTool("a".to_string()));
        assert_eq!(registry.names(), vec!["a"]);
    }

    #[test]
    fn test_verify_registry_requires_shell() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Named("a"))).unwrap();
        let allowlist = CommandAllowlist::new(vec!["cargo test".to_string()]).unwrap();
        let err = verify_registry(&registry, allowlist).unwrap_err();
        assert_eq!(err, RegistryError::MissingTool(RUN_COMMAND.to_string()));
    }

    #[test]
    fn test_tool_call_deserializes_without_id() {
        let call: ToolCall =
            serde_json::from_value(json!({ "name": "read_file", "arguments": { "path": "a" } }))
                .unwrap();
        assert!(!call.id.is_empty());
        assert_eq!(call.arguments.str("path"), Some("a"));
    }
}
