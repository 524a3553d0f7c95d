//! Tool execution scheduler.
//!
//! [`ToolScheduler::execute_batch`] runs a batch of tool calls and returns one
//! result per call, in input order. Read-only calls start immediately.
//! Mutating calls queue on their resource keys in submission order: disjoint
//! keys run concurrently, overlapping keys never interleave.

pub mod keys;
pub mod ordering;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ToolError;
use crate::events::EventSink;
use crate::project::ProjectRoot;
use crate::tools::{
    InvocationDefaults, ProgressSink, Tool, ToolArguments, ToolCall, ToolContext,
    ToolInvocationContext, ToolRegistry,
};

use keys::KeyResolver;
use ordering::{KeyedQueue, Registration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
    Cancelled,
    TimedOut,
}

/// Outcome of one tool call, as appended to the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResultMessage {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: String,
    pub status: ToolStatus,
}

impl ToolResultMessage {
    pub fn success(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content: content.into(),
            status: ToolStatus::Success,
        }
    }

    pub fn failure(call: &ToolCall, error: &ToolError) -> Self {
        let status = match error {
            ToolError::Cancelled => ToolStatus::Cancelled,
            ToolError::TimedOut { .. } => ToolStatus::TimedOut,
            _ => ToolStatus::Error,
        };
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content: format!("Error: {}", error),
            status,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status != ToolStatus::Success
    }
}

pub struct ToolScheduler {
    resolver: KeyResolver,
    queue: KeyedQueue,
    events: Arc<dyn EventSink>,
    defaults: InvocationDefaults,
    progress: Option<Arc<dyn ProgressSink>>,
    cancellations: Arc<Mutex<HashMap<String, CancellationToken>>>,
    shutdown: CancellationToken,
}

impl ToolScheduler {
    pub fn new(project: ProjectRoot, events: Arc<dyn EventSink>) -> Self {
        Self {
            resolver: KeyResolver::new(project),
            queue: KeyedQueue::new(),
            events,
            defaults: InvocationDefaults::default(),
            progress: None,
            cancellations: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_defaults(mut self, defaults: InvocationDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Route streamed tool output (shell lines) to `sink`.
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn defaults(&self) -> &InvocationDefaults {
        &self.defaults
    }

    pub async fn execute_batch(
        &self,
        calls: Vec<ToolCall>,
        tools: &ToolRegistry,
    ) -> Vec<ToolResultMessage> {
        self.execute_batch_with(calls, tools, &self.defaults).await
    }

    /// Same as [`ToolScheduler::execute_batch`] with explicit defaults.
    pub async fn execute_batch_with(
        &self,
        calls: Vec<ToolCall>,
        tools: &ToolRegistry,
        defaults: &InvocationDefaults,
    ) -> Vec<ToolResultMessage> {
        debug!("Executing batch of {} tool call(s)", calls.len());

        // Registration happens here, synchronously and in input order
        let pending: Vec<_> = calls
            .into_iter()
            .map(|call| self.submit(call, tools, defaults))
            .collect();

        join_all(pending.into_iter().map(|p| self.finish(p))).await
    }

    fn submit(
        &self,
        call: ToolCall,
        tools: &ToolRegistry,
        defaults: &InvocationDefaults,
    ) -> Pending {
        let Some(tool) = tools.get(&call.name) else {
            warn!("Model requested unknown tool '{}'", call.name);
            let error = ToolError::ToolNotFound {
                name: call.name.clone(),
                available: tools.names(),
            };
            return Pending::Ready(ToolResultMessage::failure(&call, &error));
        };

        let invocation = match ToolInvocationContext::from_call(&call, defaults) {
            Ok(invocation) => invocation,
            Err(error) => return Pending::Ready(ToolResultMessage::failure(&call, &error)),
        };

        let access = self
            .resolver
            .resolve(&tool.access(), &call.arguments, &invocation);
        debug!("{} ({}) access: {:?}", call.name, call.id, access);
        let registration = self.queue.register(&access);

        let cancel = self.shutdown.child_token();
        self.lock_cancellations()
            .insert(call.id.clone(), cancel.clone());

        let ctx = ToolContext { invocation, cancel };
        let handle = tokio::spawn(run_call(
            tool,
            call.clone(),
            ctx,
            registration,
            self.progress.clone(),
            self.events.clone(),
        ));
        Pending::Spawned { call, handle }
    }

    async fn finish(&self, pending: Pending) -> ToolResultMessage {
        match pending {
            Pending::Ready(result) => result,
            Pending::Spawned { call, handle } => {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(join_error) => {
                        warn!("Tool '{}' ({}) aborted: {}", call.name, call.id, join_error);
                        let reason = if join_error.is_panic() {
                            format!("Tool '{}' panicked", call.name)
                        } else {
                            format!("Tool '{}' was aborted", call.name)
                        };
                        ToolResultMessage::failure(&call, &ToolError::Failed(reason))
                    }
                };
                self.lock_cancellations().remove(&call.id);
                result
            }
        }
    }

    /// Cancel an in-flight call. Returns `false` if no such call is running.
    pub fn cancel(&self, tool_call_id: &str) -> bool {
        match self.lock_cancellations().get(tool_call_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight call, now and in the future.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    fn lock_cancellations(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        match self.cancellations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

enum Pending {
    Ready(ToolResultMessage),
    Spawned {
        call: ToolCall,
        handle: tokio::task::JoinHandle<ToolResultMessage>,
    },
}

async fn run_call(
    tool: Arc<dyn Tool>,
    call: ToolCall,
    ctx: ToolContext,
    registration: Option<Registration>,
    progress: Option<Arc<dyn ProgressSink>>,
    events: Arc<dyn EventSink>,
) -> ToolResultMessage {
    let _permit = match registration {
        Some(registration) => {
            tokio::select! {
                permit = registration.ready() => Some(permit),
                _ = ctx.cancel.cancelled() => {
                    return ToolResultMessage::failure(&call, &ToolError::Cancelled);
                }
            }
        }
        None => None,
    };
    if ctx.cancel.is_cancelled() {
        return ToolResultMessage::failure(&call, &ToolError::Cancelled);
    }

    let args: &ToolArguments = &call.arguments;
    let result = match &progress {
        Some(sink) => tool.execute_streaming(&ctx, args, sink.as_ref()).await,
        None => tool.execute(&ctx, args).await,
    };

    match result {
        Ok(output) => {
            for change in output.changes {
                events.publish(change);
            }
            ToolResultMessage::success(&call, output.content)
        }
        Err(error) => {
            debug!("{} ({}) failed: {}", call.name, call.id, error);
            ToolResultMessage::failure(&call, &error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BroadcastEventSink, FileEvent, NullEventSink};
    use crate::scheduler::keys::AccessRule;
    use crate::tools::ToolOutput;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Sleeps, tracking how many calls overlap overall and per path.
    #[derive(Default)]
    struct TrackingTool {
        running: AtomicUsize,
        peak: AtomicUsize,
        per_path: Mutex<HashMap<String, usize>>,
        overlaps: AtomicUsize,
        order: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Tool for TrackingTool {
        fn name(&self) -> &str {
            "tracking"
        }
        fn description(&self) -> &str {
            "records concurrent runs"
        }
        fn parameters(&self) -> Value {
            json!({ "type": "object" })
        }
        fn access(&self) -> AccessRule {
            AccessRule::PathArgument("path")
        }
        async fn execute(
            &self,
            ctx: &ToolContext,
            args: &ToolArguments,
        ) -> Result<ToolOutput, ToolError> {
            let path = args.require_str("path")?.to_string();
            {
                let mut per_path = self.per_path.lock().unwrap();
                let count = per_path.entry(path.clone()).or_insert(0);
                *count += 1;
                if *count > 1 {
                    self.overlaps.fetch_add(1, Ordering::SeqCst);
                }
            }
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.order.lock().unwrap().push(ctx.call_id().to_string());

            tokio::time::sleep(Duration::from_millis(40)).await;

            self.running.fetch_sub(1, Ordering::SeqCst);
            *self.per_path.lock().unwrap().get_mut(&path).unwrap() -= 1;
            Ok(ToolOutput::text(format!("done {}", path))
                .with_changes(vec![FileEvent::FileModified(path)]))
        }
    }

    struct PanicTool;

    #[async_trait]
    impl Tool for PanicTool {
        fn name(&self) -> &str {
            "explode"
        }
        fn description(&self) -> &str {
            "panics"
        }
        fn parameters(&self) -> Value {
            json!({ "type": "object" })
        }
        fn access(&self) -> AccessRule {
            AccessRule::ReadOnly
        }
        async fn execute(
            &self,
            _ctx: &ToolContext,
            _args: &ToolArguments,
        ) -> Result<ToolOutput, ToolError> {
            panic!("boom");
        }
    }

    /// Waits until cancelled.
    struct BlockingTool;

    #[async_trait]
    impl Tool for BlockingTool {
        fn name(&self) -> &str {
            "block"
        }
        fn description(&self) -> &str {
            "waits for cancellation"
        }
        fn parameters(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(
            &self,
            ctx: &ToolContext,
            _args: &ToolArguments,
        ) -> Result<ToolOutput, ToolError> {
            ctx.cancel.cancelled().await;
            Err(ToolError::Cancelled)
        }
    }

    fn setup(temp_dir: &TempDir) -> (Arc<TrackingTool>, ToolRegistry, ToolScheduler) {
        let tracker = Arc::new(TrackingTool::default());
        let mut registry = ToolRegistry::new();
        registry.register(tracker.clone()).unwrap();
        registry.register(Arc::new(PanicTool)).unwrap();
        registry.register(Arc::new(BlockingTool)).unwrap();
        let scheduler = ToolScheduler::new(
            ProjectRoot::new(temp_dir.path()),
            Arc::new(NullEventSink),
        );
        (tracker, registry, scheduler)
    }

    fn tracked_call(id: &str, path: &str) -> ToolCall {
        ToolCall::new("tracking", json!({ "path": path })).with_id(id)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_path_calls_never_overlap_and_keep_order() {
        let temp_dir = TempDir::new().unwrap();
        let (tracker, registry, scheduler) = setup(&temp_dir);

        let calls = vec![
            tracked_call("1", "a.txt"),
            tracked_call("2", "./a.txt"),
            tracked_call("3", &temp_dir.path().join("a.txt").to_string_lossy()),
        ];
        let results = scheduler.execute_batch(calls, &registry).await;

        assert_eq!(tracker.overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.peak.load(Ordering::SeqCst), 1);
        assert_eq!(*tracker.order.lock().unwrap(), vec!["1", "2", "3"]);
        let ids: Vec<_> = results.iter().map(|r| r.tool_call_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_disjoint_paths_run_concurrently() {
        let temp_dir = TempDir::new().unwrap();
        let (tracker, registry, scheduler) = setup(&temp_dir);

        let calls = (0..4)
            .map(|i| tracked_call(&i.to_string(), &format!("f{}.txt", i)))
            .collect();
        let results = scheduler.execute_batch(calls, &registry).await;

        assert!(results.iter().all(|r| r.status == ToolStatus::Success));
        assert!(tracker.peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_unknown_tool_and_panic_become_results() {
        let temp_dir = TempDir::new().unwrap();
        let (_tracker, registry, scheduler) = setup(&temp_dir);

        let calls = vec![
            ToolCall::new("nope", json!({})).with_id("a"),
            ToolCall::new("explode", json!({})).with_id("b"),
            tracked_call("c", "x.txt"),
        ];
        let results = scheduler.execute_batch(calls, &registry).await;

        assert_eq!(results.len(), 3);
        assert!(results[0].content.contains("Tool 'nope' not found"));
        assert!(results[0].content.contains("tracking"));
        assert_eq!(results[1].status, ToolStatus::Error);
        assert!(results[1].content.contains("panicked"));
        assert_eq!(results[2].status, ToolStatus::Success);
    }

    #[tokio::test]
    async fn test_success_publishes_changes() {
        let temp_dir = TempDir::new().unwrap();
        let (_tracker, registry, _) = setup(&temp_dir);
        let sink = Arc::new(BroadcastEventSink::new(16));
        let mut rx = sink.subscribe();
        let scheduler = ToolScheduler::new(ProjectRoot::new(temp_dir.path()), sink);

        scheduler
            .execute_batch(vec![tracked_call("1", "a.txt")], &registry)
            .await;
        assert_eq!(
            rx.recv().await.unwrap(),
            FileEvent::FileModified("a.txt".to_string())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_in_flight_call() {
        let temp_dir = TempDir::new().unwrap();
        let (_tracker, registry, scheduler) = setup(&temp_dir);
        let scheduler = Arc::new(scheduler);

        let runner = {
            let scheduler = scheduler.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                scheduler
                    .execute_batch(
                        vec![ToolCall::new("block", json!({})).with_id("slow")],
                        &registry,
                    )
                    .await
            })
        };

        let mut cancelled = false;
        for _ in 0..100 {
            if scheduler.cancel("slow") {
                cancelled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cancelled);

        let results = runner.await.unwrap();
        assert_eq!(results[0].status, ToolStatus::Cancelled);
        assert!(!scheduler.cancel("slow"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_staging_and_clear_of_one_patch_set_keep_order() {
        use crate::config::CoreConfig;
        use crate::services::ProjectServices;
        use crate::tools::builtin_registry;

        let temp_dir = TempDir::new().unwrap();
        let services = ProjectServices::open(temp_dir.path(), CoreConfig::default()).unwrap();
        let registry = builtin_registry(&services).unwrap();
        let scheduler = ToolScheduler::new(services.project.clone(), Arc::new(NullEventSink));

        for round in 0..40 {
            let calls = vec![
                ToolCall::new(
                    "write_file",
                    json!({
                        "path": format!("f{}.txt", round),
                        "content": "x",
                        "mode": "propose",
                        "patch_set_id": "s",
                    }),
                ),
                ToolCall::new("clear_patch_set", json!({ "patch_set_id": "s" })),
            ];
            let results = scheduler.execute_batch(calls, &registry).await;
            assert!(results.iter().all(|r| r.status == ToolStatus::Success));
            assert!(
                services.patches.load_manifest("s").await.unwrap().is_none(),
                "staged entry outlived the later clear in round {}",
                round
            );
        }
    }

    #[tokio::test]
    async fn test_invalid_mode_is_an_argument_error() {
        let temp_dir = TempDir::new().unwrap();
        let (tracker, registry, scheduler) = setup(&temp_dir);

        let call = ToolCall::new("tracking", json!({ "path": "a.txt", "mode": "sideways" }));
        let results = scheduler.execute_batch(vec![call], &registry).await;
        assert!(results[0].content.contains("Invalid argument 'mode'"));
        assert!(tracker.order.lock().unwrap().is_empty());
    }
}
