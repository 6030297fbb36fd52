//! Tool Dispatcher - Executes narrator tool calls against registered handlers.
//!
//! Each tool has an argument schema, an async handler and a logging policy.
//! Every dispatch, successful or not, leaves a `tool_call` event in the
//! session log before control returns to the caller. Only persistence
//! failures escape as errors; everything else becomes a [`ToolResult`] the
//! narrator can read and react to.

mod builtin;
mod schema;

pub use builtin::*;
pub use schema::*;

use async_trait::async_trait;
use game_rules::{DiceRoller, WorldState};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{HandlerError, SessionError, ToolError};
use crate::session_log::{EventId, EventType, MetaValue, Metadata, NewEvent, SessionLog};

/// Default actor label for `tool_call` records.
pub const DEFAULT_TOOL_ACTOR: &str = "DM";

/// When the `tool_call` record of a tool is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogPolicy {
    /// Appended by the dispatcher once the handler returns.
    #[default]
    AfterCall,

    /// Written by the handler into the scene it closes, in the same durable
    /// write. Failed calls still fall back to `AfterCall`.
    InClosingScene,
}

/// What a handler produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    /// Text shown to the narrator.
    pub message: String,

    /// Structured result, recorded under `result` in the audit record.
    pub data: Value,

    /// Extra top-level metadata for the audit record.
    pub metadata: Metadata,
}

impl ToolOutput {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: Value::Null,
            metadata: Metadata::new(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// The structured result of one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub tool: String,
    pub outcome: Result<ToolOutput, ToolError>,

    /// The `tool_call` event recording this dispatch, if one was written.
    pub event_id: Option<EventId>,
}

impl ToolResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Text fed back to the narrator.
    pub fn content(&self) -> String {
        match &self.outcome {
            Ok(output) => output.message.clone(),
            Err(e) => format!("Error: {}", e),
        }
    }
}

/// Mutable state a handler may act on.
pub struct ToolContext<'a> {
    pub log: &'a mut SessionLog,
    pub world: &'a mut WorldState,
    pub roller: &'a dyn DiceRoller,
    pending: Option<NewEvent>,
}

impl<'a> ToolContext<'a> {
    pub fn new(
        log: &'a mut SessionLog,
        world: &'a mut WorldState,
        roller: &'a dyn DiceRoller,
    ) -> Self {
        Self {
            log,
            world,
            roller,
            pending: None,
        }
    }

    /// Session id as recorded in campaign state.
    pub fn session_label(&self) -> String {
        self.log.id().to_string()
    }

    /// Take the audit record for the call in progress, completed with
    /// `output`. Only meaningful for [`LogPolicy::InClosingScene`] tools;
    /// once taken, the dispatcher does not write it again.
    pub fn take_audit_record(&mut self, output: &ToolOutput) -> Option<NewEvent> {
        let record = self.pending.take()?;
        Some(complete_record(record, Ok(output)))
    }
}

/// A tool implementation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(
        &self,
        ctx: &mut ToolContext<'_>,
        args: &ToolArgs,
    ) -> Result<ToolOutput, HandlerError>;
}

/// A registered tool.
#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub schema: ArgSchema,
    pub handler: Arc<dyn ToolHandler>,
    pub log_policy: LogPolicy,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: ArgSchema,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            handler,
            log_policy: LogPolicy::AfterCall,
        }
    }

    pub fn with_log_policy(mut self, policy: LogPolicy) -> Self {
        self.log_policy = policy;
        self
    }

    /// Function description in the chat-completions tool format.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.schema.to_json(),
            }
        })
    }
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("log_policy", &self.log_policy)
            .finish()
    }
}

/// Registry of tools keyed by name.
#[derive(Debug, Clone)]
pub struct ToolDispatcher {
    tools: BTreeMap<String, ToolSpec>,
    timeout: Duration,
    actor: String,
}

impl Default for ToolDispatcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl ToolDispatcher {
    /// An empty registry with the given per-call timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            tools: BTreeMap::new(),
            timeout,
            actor: DEFAULT_TOOL_ACTOR.to_string(),
        }
    }

    /// A registry holding the scene, logging, dice and campaign tools.
    pub fn with_builtins(timeout: Duration) -> Self {
        let mut dispatcher = Self::new(timeout);
        for spec in builtin_tools() {
            dispatcher.register(spec);
        }
        dispatcher
    }

    /// Actor label written on `tool_call` records.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Every registered tool as a function description for the narrator.
    pub fn tool_schemas(&self) -> Vec<Value> {
        self.tools.values().map(ToolSpec::to_json).collect()
    }

    /// Validate and run one tool call, then record it.
    ///
    /// Returns `Err` only for persistence failures, which end the turn.
    pub async fn dispatch(
        &self,
        ctx: &mut ToolContext<'_>,
        name: &str,
        args: &Value,
    ) -> Result<ToolResult, SessionError> {
        let template = NewEvent::new(EventType::ToolCall, self.actor.as_str(), name)
            .with_meta("tool", name)
            .with_meta("args", MetaValue::from_json(args));

        let (outcome, policy) = match self.tools.get(name) {
            None => (Err(ToolError::UnknownTool(name.to_string())), LogPolicy::AfterCall),
            Some(spec) => (self.invoke(ctx, spec, args, &template).await?, spec.log_policy),
        };

        let audit_taken = ctx.pending.take().is_none();
        let event_id = if outcome.is_ok() && policy == LogPolicy::InClosingScene && audit_taken {
            ctx.log
                .scenes()
                .last()
                .and_then(|s| s.events.last())
                .map(|e| e.id)
        } else {
            self.record(ctx.log, complete_record(template, outcome.as_ref()))?
        };

        match &outcome {
            Ok(_) => info!(tool = name, "tool call succeeded"),
            Err(e) => warn!(tool = name, error = %e, "tool call failed"),
        }

        Ok(ToolResult {
            tool: name.to_string(),
            outcome,
            event_id,
        })
    }

    async fn invoke(
        &self,
        ctx: &mut ToolContext<'_>,
        spec: &ToolSpec,
        args: &Value,
        template: &NewEvent,
    ) -> Result<Result<ToolOutput, ToolError>, SessionError> {
        let args = match spec.schema.validate(args) {
            Ok(args) => args,
            Err(message) => {
                return Ok(Err(ToolError::Argument {
                    tool: spec.name.clone(),
                    message,
                }))
            }
        };

        ctx.pending = (spec.log_policy == LogPolicy::InClosingScene).then(|| template.clone());
        debug!(tool = %spec.name, "invoking tool handler");

        let called = tokio::time::timeout(self.timeout, spec.handler.call(ctx, &args)).await;
        match called {
            Err(_) => Ok(Err(ToolError::Timeout {
                tool: spec.name.clone(),
                timeout: self.timeout,
            })),
            Ok(Ok(output)) => Ok(Ok(output)),
            Ok(Err(HandlerError::Session(e))) if e.is_fatal() => Err(e),
            Ok(Err(e)) => Ok(Err(ToolError::Execution {
                tool: spec.name.clone(),
                message: e.to_string(),
            })),
        }
    }

    /// Append an audit record to the active scene, or drop it with a warning
    /// when no scene is open to hold it.
    fn record(&self, log: &mut SessionLog, record: NewEvent) -> Result<Option<EventId>, SessionError> {
        if log.active_scene().is_none() {
            warn!(
                session_id = %log.id(),
                record = %record.content,
                "no active scene; tool call record dropped"
            );
            return Ok(None);
        }
        log.append(record).map(Some)
    }
}

/// Fill in outcome, content and result metadata on an audit record.
fn complete_record(mut record: NewEvent, outcome: Result<&ToolOutput, &ToolError>) -> NewEvent {
    let tool = record.content.clone();
    match outcome {
        Ok(output) => {
            record.content = format!("{}: {}", tool, output.message);
            record.metadata.extend(output.metadata.clone());
            record.metadata.insert("outcome".into(), "ok".into());
            if !output.data.is_null() {
                record
                    .metadata
                    .insert("result".into(), MetaValue::from_json(&output.data));
            }
        }
        Err(e) => {
            record.content = format!("{}: {}", tool, e);
            record.metadata.insert("outcome".into(), "error".into());
            record.metadata.insert("error".into(), e.to_string().into());
        }
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_log::{EventFilter, MemoryStore};
    use game_rules::{DiceError, RollResult, StandardRoller};
    use serde_json::json;

    struct FixedRoller(Vec<i64>);

    impl DiceRoller for FixedRoller {
        fn roll(&self, notation: &str) -> Result<RollResult, DiceError> {
            let expr = game_rules::DiceExpr::parse(notation)?;
            let total = self.0.iter().sum::<i64>() + expr.modifier;
            Ok(RollResult {
                total,
                rolls: self.0.clone(),
                modifier: expr.modifier,
                notation: notation.to_string(),
            })
        }
    }

    struct Sleepy;

    #[async_trait]
    impl ToolHandler for Sleepy {
        async fn call(
            &self,
            _ctx: &mut ToolContext<'_>,
            _args: &ToolArgs,
        ) -> Result<ToolOutput, HandlerError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ToolOutput::new("done"))
        }
    }

    fn setup_log() -> (Arc<MemoryStore>, SessionLog) {
        let store = Arc::new(MemoryStore::new());
        let log = SessionLog::create_with_opening_scene(
            store.clone(),
            "Tavern",
            "The Shrouded Flagon",
            Vec::new(),
        )
        .unwrap();
        (store, log)
    }

    fn tool_calls(log: &SessionLog) -> Vec<crate::session_log::Event> {
        log.query_events(&EventFilter::new().of_type(EventType::ToolCall))
            .into_iter()
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn test_roll_dice_records_total() {
        let (_store, mut log) = setup_log();
        let mut world = WorldState::new();
        let roller = FixedRoller(vec![12]);
        let dispatcher = ToolDispatcher::with_builtins(Duration::from_secs(5));

        let mut ctx = ToolContext::new(&mut log, &mut world, &roller);
        let result = dispatcher
            .dispatch(
                &mut ctx,
                "roll_dice",
                &json!({"notation": "1d20+3", "reason": "Perception"}),
            )
            .await
            .unwrap();

        let output = result.outcome.as_ref().unwrap();
        assert_eq!(output.data["total"], json!(15));
        assert!(result.event_id.is_some());

        let calls = tool_calls(&log);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].metadata["tool"], MetaValue::from("roll_dice"));
        assert_eq!(calls[0].metadata["outcome"], MetaValue::from("ok"));
        assert_eq!(calls[0].metadata["total"], MetaValue::Int(15));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_reported_and_logged() {
        let (_store, mut log) = setup_log();
        let mut world = WorldState::new();
        let roller = StandardRoller::seeded(1);
        let dispatcher = ToolDispatcher::with_builtins(Duration::from_secs(5));

        let mut ctx = ToolContext::new(&mut log, &mut world, &roller);
        let result = dispatcher
            .dispatch(&mut ctx, "cast_fireball", &json!({}))
            .await
            .unwrap();

        assert_eq!(
            result.outcome,
            Err(ToolError::UnknownTool("cast_fireball".to_string()))
        );
        let calls = tool_calls(&log);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].metadata["outcome"], MetaValue::from("error"));
    }

    #[tokio::test]
    async fn test_argument_error() {
        let (_store, mut log) = setup_log();
        let mut world = WorldState::new();
        let roller = StandardRoller::seeded(1);
        let dispatcher = ToolDispatcher::with_builtins(Duration::from_secs(5));

        let mut ctx = ToolContext::new(&mut log, &mut world, &roller);
        let result = dispatcher
            .dispatch(&mut ctx, "roll_dice", &json!({"notation": "d20"}))
            .await
            .unwrap();
        assert!(matches!(result.outcome, Err(ToolError::Argument { .. })));
        assert!(result.content().starts_with("Error:"));
    }

    #[tokio::test]
    async fn test_handler_failure_becomes_execution_error() {
        let (_store, mut log) = setup_log();
        let mut world = WorldState::new();
        let roller = StandardRoller::seeded(1);
        let dispatcher = ToolDispatcher::with_builtins(Duration::from_secs(5));

        let mut ctx = ToolContext::new(&mut log, &mut world, &roller);
        let bad_roll = dispatcher
            .dispatch(
                &mut ctx,
                "roll_dice",
                &json!({"notation": "banana", "reason": "x"}),
            )
            .await
            .unwrap();
        assert!(matches!(bad_roll.outcome, Err(ToolError::Execution { .. })));

        // A scene is already open.
        let second_scene = dispatcher
            .dispatch(
                &mut ctx,
                "start_scene",
                &json!({"title": "Road", "location": "North Road"}),
            )
            .await
            .unwrap();
        assert!(matches!(second_scene.outcome, Err(ToolError::Execution { .. })));
        assert_eq!(tool_calls(&log).len(), 2);
    }

    #[tokio::test]
    async fn test_end_scene_records_in_closing_scene() {
        let (_store, mut log) = setup_log();
        let mut world = WorldState::new();
        let roller = StandardRoller::seeded(1);
        let dispatcher = ToolDispatcher::with_builtins(Duration::from_secs(5));

        let mut ctx = ToolContext::new(&mut log, &mut world, &roller);
        let result = dispatcher
            .dispatch(&mut ctx, "end_scene", &json!({"summary": "They left."}))
            .await
            .unwrap();
        assert!(result.is_ok());

        let scene = &log.scenes()[0];
        assert!(!scene.active);
        assert_eq!(scene.summary.as_deref(), Some("They left."));
        let last = scene.events.last().unwrap();
        assert_eq!(last.event_type, EventType::ToolCall);
        assert_eq!(result.event_id, Some(last.id));
    }

    #[tokio::test]
    async fn test_failed_call_without_scene_drops_record() {
        let (_store, mut log) = setup_log();
        log.end_scene(None).unwrap();
        let mut world = WorldState::new();
        let roller = StandardRoller::seeded(1);
        let dispatcher = ToolDispatcher::with_builtins(Duration::from_secs(5));

        let mut ctx = ToolContext::new(&mut log, &mut world, &roller);
        let result = dispatcher
            .dispatch(&mut ctx, "end_scene", &json!({}))
            .await
            .unwrap();
        assert!(matches!(result.outcome, Err(ToolError::Execution { .. })));
        assert_eq!(result.event_id, None);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_fatal() {
        let (store, mut log) = setup_log();
        store.set_reject_writes(true);
        let mut world = WorldState::new();
        let roller = StandardRoller::seeded(1);
        let dispatcher = ToolDispatcher::with_builtins(Duration::from_secs(5));

        let mut ctx = ToolContext::new(&mut log, &mut world, &roller);
        let err = dispatcher
            .dispatch(
                &mut ctx,
                "log_event",
                &json!({"event_type": "npc_action", "content": "The barkeep nods"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Persistence(_)));
        assert_eq!(log.session().event_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout() {
        let (_store, mut log) = setup_log();
        let mut world = WorldState::new();
        let roller = StandardRoller::seeded(1);
        let mut dispatcher = ToolDispatcher::new(Duration::from_secs(1));
        dispatcher.register(ToolSpec::new(
            "wait",
            "Waits forever",
            ArgSchema::new(),
            Arc::new(Sleepy),
        ));

        let mut ctx = ToolContext::new(&mut log, &mut world, &roller);
        let result = dispatcher
            .dispatch(&mut ctx, "wait", &json!({}))
            .await
            .unwrap();
        assert!(matches!(result.outcome, Err(ToolError::Timeout { .. })));
        assert_eq!(tool_calls(&log).len(), 1);
    }

    #[test]
    fn test_tool_schemas_cover_builtins() {
        let dispatcher = ToolDispatcher::with_builtins(Duration::from_secs(5));
        let names: Vec<String> = dispatcher
            .tool_schemas()
            .iter()
            .map(|s| s["function"]["name"].as_str().unwrap().to_string())
            .collect();
        for expected in [
            "roll_dice",
            "start_scene",
            "end_scene",
            "log_event",
            "track_npc",
            "track_location",
            "add_plot_thread",
            "update_plot_thread",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {}", expected);
        }
    }
}
