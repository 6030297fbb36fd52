//! Interaction Loop - Drives one narrator turn from player input to narration.
//!
//! ```text
//! Idle ──input──▶ AwaitingModel ──narration──▶ Done
//!                   ▲        │
//!                   │    tool calls
//!                   │        ▼
//!                   └── ExecutingTools
//!
//! any state ──(bound, cancel, model or persistence failure)──▶ Failed
//! ```
//!
//! Tool calls are dispatched one at a time, in the order the narrator asked
//! for them. Events are durable as soon as they are logged, so a failed or
//! cancelled turn keeps everything that already happened.

use futures::StreamExt;
use game_rules::{DiceRoller, WorldState};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TurnSettings;
use crate::context_assembler::ContextAssembler;
use crate::error::{ModelError, SessionError};
use crate::narrator::{ChatMessage, NarratorClient, NarratorReply, ToolCall};
use crate::session_log::{EventType, Metadata, SessionLog};
use crate::tools::{ToolContext, ToolDispatcher};

const SYSTEM_PROMPT: &str = "You are the game master of a tabletop role-playing game.

Describe the world vividly but concisely, voice NPCs with distinct motives, apply the rules fairly \
and show the consequences of the player's choices without railroading them.

Use your tools: roll dice for uncertain outcomes and narrate the result afterwards, start a new \
scene when the location or situation changes, end scenes with a short summary, and log important \
events. When campaign tools are available, keep NPCs, locations and plot threads up to date.

NPCs only know what they have learned. Stay consistent with the campaign and the session so far.";

/// Title given to a scene opened because a turn started without one.
pub const AUTO_SCENE_TITLE: &str = "Opening scene";
pub const AUTO_SCENE_LOCATION: &str = "Unknown";

/// States of the per-turn state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    AwaitingModel,
    ExecutingTools,
    Done,
    Failed,
}

/// Why a turn failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnFailure {
    /// The narrator kept asking for tools past the iteration bound.
    ToolLoopExceeded,
    Cancelled,
    /// The narrator could not be reached, even after retries.
    ModelCommunication,
    /// A durable write failed.
    Persistence,
    /// No scene was active and automatic opening is disabled.
    NoActiveScene,
}

impl TurnFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnFailure::ToolLoopExceeded => "tool_loop_exceeded",
            TurnFailure::Cancelled => "cancelled",
            TurnFailure::ModelCommunication => "model_communication",
            TurnFailure::Persistence => "persistence",
            TurnFailure::NoActiveScene => "no_active_scene",
        }
    }

    /// Text shown to the player in place of narration.
    pub fn degraded_response(&self) -> &'static str {
        match self {
            TurnFailure::ToolLoopExceeded => {
                "The story stalls for a moment. Try describing your action again."
            }
            TurnFailure::Cancelled => "The turn was interrupted.",
            TurnFailure::ModelCommunication => {
                "The narrator cannot be reached right now. Try again shortly."
            }
            TurnFailure::Persistence => {
                "The session could not be saved, so this turn was not completed."
            }
            TurnFailure::NoActiveScene => "No scene is in progress. Start a scene first.",
        }
    }
}

impl std::fmt::Display for TurnFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed { narration: String },
    Failed { reason: TurnFailure, message: String },
}

/// Everything observable about one turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnReport {
    pub outcome: TurnOutcome,

    /// Every state entered, starting with `Idle`.
    pub transitions: Vec<TurnState>,
    pub tool_iterations: u32,
}

impl TurnReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, TurnOutcome::Completed { .. })
    }

    pub fn failure(&self) -> Option<TurnFailure> {
        match &self.outcome {
            TurnOutcome::Failed { reason, .. } => Some(*reason),
            TurnOutcome::Completed { .. } => None,
        }
    }

    pub fn final_state(&self) -> TurnState {
        self.transitions.last().copied().unwrap_or(TurnState::Idle)
    }

    /// How many times the turn waited on the narrator.
    pub fn model_visits(&self) -> usize {
        self.transitions
            .iter()
            .filter(|s| **s == TurnState::AwaitingModel)
            .count()
    }

    /// What to show the player: the narration, or a degraded response.
    pub fn response(&self) -> &str {
        match &self.outcome {
            TurnOutcome::Completed { narration } => narration,
            TurnOutcome::Failed { reason, .. } => reason.degraded_response(),
        }
    }
}

/// Progress published by [`InteractionLoop::run_turn_streaming`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnUpdate {
    /// Incremental narration text.
    Narration { text: String },

    ToolCall { name: String, args: Value },

    ToolResult { name: String, content: String, ok: bool },
}

/// Policy knobs for the loop.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopConfig {
    pub max_tool_iterations: u32,
    pub model_timeout: Duration,
    pub model_retries: u32,
    pub backoff_base: Duration,
    pub narrator_actor: String,
    pub player_actor: String,
    pub auto_open_scene: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from(&TurnSettings::default())
    }
}

impl From<&TurnSettings> for LoopConfig {
    fn from(settings: &TurnSettings) -> Self {
        Self {
            max_tool_iterations: settings.max_tool_iterations,
            model_timeout: settings.model_timeout(),
            model_retries: settings.model_retries,
            backoff_base: settings.backoff_base(),
            narrator_actor: settings.narrator_actor.clone(),
            player_actor: settings.player_actor.clone(),
            auto_open_scene: settings.auto_open_scene,
        }
    }
}

/// Why the turn left the happy path, before it is recorded.
struct Abort {
    reason: TurnFailure,
    message: String,
}

impl Abort {
    fn new(reason: TurnFailure, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    fn persistence(err: SessionError) -> Self {
        Self::new(TurnFailure::Persistence, err.to_string())
    }

    /// Only failed writes are persistence failures; anything else the log
    /// rejects means there was no scene to write into.
    fn session(err: SessionError) -> Self {
        if err.is_fatal() {
            Self::persistence(err)
        } else {
            Self::new(TurnFailure::NoActiveScene, err.to_string())
        }
    }

    fn cancelled() -> Self {
        Self::new(TurnFailure::Cancelled, "turn cancelled")
    }
}

enum AttemptError {
    Retryable(ModelError),
    Fatal(ModelError),
    Cancelled,
}

enum ModelAnswer {
    Narration(String),
    ToolCalls(Vec<ToolCall>),
}

/// Transition bookkeeping for one turn.
struct Turn<'a> {
    transitions: Vec<TurnState>,
    tool_iterations: u32,
    updates: Option<&'a mpsc::Sender<TurnUpdate>>,
}

impl<'a> Turn<'a> {
    fn new(updates: Option<&'a mpsc::Sender<TurnUpdate>>) -> Self {
        Self {
            transitions: vec![TurnState::Idle],
            tool_iterations: 0,
            updates,
        }
    }

    fn enter(&mut self, state: TurnState) {
        let from = self.transitions.last().copied().unwrap_or(TurnState::Idle);
        debug!(?from, to = ?state, iteration = self.tool_iterations, "turn transition");
        self.transitions.push(state);
    }

    async fn publish(&self, update: TurnUpdate) {
        if let Some(tx) = self.updates {
            // A departed listener does not stop the turn.
            let _ = tx.send(update).await;
        }
    }

    fn finish(self, outcome: TurnOutcome) -> TurnReport {
        TurnReport {
            outcome,
            transitions: self.transitions,
            tool_iterations: self.tool_iterations,
        }
    }
}

/// Coordinates the narrator, the tool dispatcher and the session log.
pub struct InteractionLoop {
    narrator: Arc<dyn NarratorClient>,
    dispatcher: ToolDispatcher,
    assembler: ContextAssembler,
    roller: Arc<dyn DiceRoller>,
    config: LoopConfig,
}

impl InteractionLoop {
    pub fn new(
        narrator: Arc<dyn NarratorClient>,
        dispatcher: ToolDispatcher,
        assembler: ContextAssembler,
        roller: Arc<dyn DiceRoller>,
        config: LoopConfig,
    ) -> Self {
        Self {
            narrator,
            dispatcher,
            assembler,
            roller,
            config,
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &ToolDispatcher {
        &self.dispatcher
    }

    /// Run one turn and return its report.
    pub async fn run_turn(
        &self,
        log: &mut SessionLog,
        world: &mut WorldState,
        input: &str,
        cancel: &CancellationToken,
    ) -> TurnReport {
        self.drive(log, world, input, cancel, Turn::new(None)).await
    }

    /// Run one turn, publishing narration chunks and tool activity as they
    /// happen.
    pub async fn run_turn_streaming(
        &self,
        log: &mut SessionLog,
        world: &mut WorldState,
        input: &str,
        cancel: &CancellationToken,
        updates: &mpsc::Sender<TurnUpdate>,
    ) -> TurnReport {
        self.drive(log, world, input, cancel, Turn::new(Some(updates)))
            .await
    }

    async fn drive(
        &self,
        log: &mut SessionLog,
        world: &mut WorldState,
        input: &str,
        cancel: &CancellationToken,
        mut turn: Turn<'_>,
    ) -> TurnReport {
        info!(session_id = %log.id(), "turn started");
        match self.execute(log, world, input, cancel, &mut turn).await {
            Ok(narration) => {
                turn.enter(TurnState::Done);
                info!(
                    session_id = %log.id(),
                    tool_iterations = turn.tool_iterations,
                    "turn completed"
                );
                turn.finish(TurnOutcome::Completed { narration })
            }
            Err(abort) => {
                self.record_abort(log, &abort);
                turn.enter(TurnState::Failed);
                warn!(
                    session_id = %log.id(),
                    reason = %abort.reason,
                    message = %abort.message,
                    "turn failed"
                );
                turn.finish(TurnOutcome::Failed {
                    reason: abort.reason,
                    message: abort.message,
                })
            }
        }
    }

    async fn execute(
        &self,
        log: &mut SessionLog,
        world: &mut WorldState,
        input: &str,
        cancel: &CancellationToken,
        turn: &mut Turn<'_>,
    ) -> Result<String, Abort> {
        if cancel.is_cancelled() {
            return Err(Abort::cancelled());
        }

        self.ensure_scene(log)?;
        log.log_event(
            EventType::PlayerAction,
            self.config.player_actor.as_str(),
            input,
            Metadata::new(),
        )
        .map_err(Abort::session)?;

        let mut messages = self.opening_messages(log, world, input);
        let tools = self.dispatcher.tool_schemas();

        loop {
            turn.enter(TurnState::AwaitingModel);
            match self.await_model(&messages, &tools, cancel, turn).await? {
                ModelAnswer::Narration(text) => {
                    // A tool may have closed the scene during this turn.
                    self.ensure_scene(log)?;
                    log.log_event(
                        EventType::Narration,
                        self.config.narrator_actor.as_str(),
                        text.as_str(),
                        Metadata::new(),
                    )
                    .map_err(Abort::session)?;
                    return Ok(text);
                }
                ModelAnswer::ToolCalls(calls) => {
                    turn.tool_iterations += 1;
                    if turn.tool_iterations > self.config.max_tool_iterations {
                        return Err(Abort::new(
                            TurnFailure::ToolLoopExceeded,
                            format!(
                                "narrator requested tools more than {} times in one turn",
                                self.config.max_tool_iterations
                            ),
                        ));
                    }

                    turn.enter(TurnState::ExecutingTools);
                    messages.push(ChatMessage::assistant_tool_calls(calls.clone()));
                    self.execute_tools(log, world, &calls, cancel, turn, &mut messages)
                        .await?;
                }
            }
        }
    }

    /// Open a scene for the turn if none is active. After a closed scene the
    /// new one continues at the same location.
    fn ensure_scene(&self, log: &mut SessionLog) -> Result<(), Abort> {
        if log.active_scene().is_some() {
            return Ok(());
        }
        if !self.config.auto_open_scene {
            return Err(Abort::new(
                TurnFailure::NoActiveScene,
                "no scene is active and automatic scenes are disabled",
            ));
        }
        let (title, location, participants): (String, String, Vec<String>) =
            match log.scenes().last() {
            Some(previous) => (
                format!("{} (continued)", previous.title),
                previous.location.clone(),
                previous.participants.iter().cloned().collect(),
            ),
            None => (
                AUTO_SCENE_TITLE.to_string(),
                AUTO_SCENE_LOCATION.to_string(),
                Vec::new(),
            ),
        };
        let scene_id = log
            .start_scene(title, location, participants)
            .map_err(Abort::session)?;
        debug!(session_id = %log.id(), %scene_id, "opened scene for turn");
        Ok(())
    }

    fn opening_messages(&self, log: &SessionLog, world: &WorldState, input: &str) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];

        let briefing = world.briefing();
        if !briefing.is_empty() {
            messages.push(ChatMessage::system(format!("Campaign context:\n{}", briefing)));
        }

        let context = self.assembler.assemble(log.session());
        debug!(
            items = context.items.len(),
            size = context.size,
            dropped = context.dropped,
            "context assembled"
        );
        messages.push(ChatMessage::system(format!(
            "Session context:\n{}",
            context.to_prompt_string(log.session())
        )));
        messages.push(ChatMessage::user(input));
        messages
    }

    async fn execute_tools(
        &self,
        log: &mut SessionLog,
        world: &mut WorldState,
        calls: &[ToolCall],
        cancel: &CancellationToken,
        turn: &mut Turn<'_>,
        messages: &mut Vec<ChatMessage>,
    ) -> Result<(), Abort> {
        for call in calls {
            if cancel.is_cancelled() {
                return Err(Abort::cancelled());
            }
            turn.publish(TurnUpdate::ToolCall {
                name: call.name.clone(),
                args: call.args.clone(),
            })
            .await;

            let mut ctx = ToolContext::new(log, world, self.roller.as_ref());
            let result = self
                .dispatcher
                .dispatch(&mut ctx, &call.name, &call.args)
                .await
                .map_err(Abort::session)?;

            let content = result.content();
            turn.publish(TurnUpdate::ToolResult {
                name: call.name.clone(),
                content: content.clone(),
                ok: result.is_ok(),
            })
            .await;
            messages.push(ChatMessage::tool_result(call.id.as_str(), content));
        }
        Ok(())
    }

    /// Ask the narrator, retrying recoverable failures with exponential backoff.
    async fn await_model(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
        cancel: &CancellationToken,
        turn: &Turn<'_>,
    ) -> Result<ModelAnswer, Abort> {
        let mut attempt: u32 = 0;
        loop {
            let err = match self.attempt_model(messages, tools, cancel, turn).await {
                Ok(answer) => return Ok(answer),
                Err(AttemptError::Cancelled) => return Err(Abort::cancelled()),
                Err(AttemptError::Fatal(e)) => {
                    return Err(Abort::new(TurnFailure::ModelCommunication, e.to_string()))
                }
                Err(AttemptError::Retryable(e)) => e,
            };

            if attempt >= self.config.model_retries {
                error!(attempts = attempt + 1, error = %err, "narrator unreachable");
                return Err(Abort::new(
                    TurnFailure::ModelCommunication,
                    format!("{} (after {} attempts)", err, attempt + 1),
                ));
            }

            let delay = self.config.backoff_base.saturating_mul(1u32 << attempt.min(16));
            warn!(attempt = attempt + 1, ?delay, error = %err, "narrator call failed; retrying");
            tokio::select! {
                _ = cancel.cancelled() => return Err(Abort::cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn attempt_model(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
        cancel: &CancellationToken,
        turn: &Turn<'_>,
    ) -> Result<ModelAnswer, AttemptError> {
        let timeout = self.config.model_timeout;
        let reply = tokio::select! {
            _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
            reply = tokio::time::timeout(timeout, self.narrator.converse(messages, tools)) => reply,
        };

        let reply = match reply {
            Err(_) => return Err(AttemptError::Retryable(ModelError::Timeout(timeout))),
            Ok(Err(e)) if e.is_retryable() => return Err(AttemptError::Retryable(e)),
            Ok(Err(e)) => return Err(AttemptError::Fatal(e)),
            Ok(Ok(reply)) => reply,
        };

        let mut stream = match reply {
            NarratorReply::ToolCalls(calls) if calls.is_empty() => {
                return Err(AttemptError::Fatal(ModelError::Protocol(
                    "empty tool call list".into(),
                )))
            }
            NarratorReply::ToolCalls(calls) => return Ok(ModelAnswer::ToolCalls(calls)),
            NarratorReply::Narration(stream) => stream,
        };

        let mut text = String::new();
        let mut delivered = false;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
                next = tokio::time::timeout(timeout, stream.next()) => next,
            };
            match next {
                Ok(None) => break,
                Ok(Some(Ok(chunk))) => {
                    delivered = true;
                    turn.publish(TurnUpdate::Narration {
                        text: chunk.clone(),
                    })
                    .await;
                    text.push_str(&chunk);
                }
                Ok(Some(Err(e))) => return Err(stream_failure(e, delivered)),
                Err(_) => return Err(stream_failure(ModelError::Timeout(timeout), delivered)),
            }
        }

        if text.trim().is_empty() {
            return Err(AttemptError::Fatal(ModelError::Protocol(
                "narrator returned empty narration".into(),
            )));
        }
        Ok(ModelAnswer::Narration(text))
    }

    /// Leave a `system` event describing the abort, when a scene can hold it.
    fn record_abort(&self, log: &mut SessionLog, abort: &Abort) {
        if matches!(
            abort.reason,
            TurnFailure::Persistence | TurnFailure::NoActiveScene
        ) || log.active_scene().is_none()
        {
            return;
        }

        let mut metadata = Metadata::new();
        metadata.insert("reason".into(), abort.reason.as_str().into());
        let content = format!("Turn aborted ({}): {}", abort.reason, abort.message);
        if let Err(e) = log.log_event(EventType::System, "system", content, metadata) {
            error!(session_id = %log.id(), error = %e, "failed to record turn abort");
        }
    }
}

/// Once narration has reached the player, retrying would duplicate it.
fn stream_failure(err: ModelError, delivered: bool) -> AttemptError {
    if delivered || !err.is_retryable() {
        AttemptError::Fatal(err)
    } else {
        AttemptError::Retryable(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_log::{EventFilter, MemoryStore};
    use async_trait::async_trait;
    use futures::stream;
    use game_rules::{DiceError, RollResult, StandardRoller};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum Scripted {
        Text(Vec<&'static str>),
        Tools(Vec<ToolCall>),
        Fail(ModelError),
        /// Yields the chunks, then fails.
        Broken(Vec<&'static str>, ModelError),
        Hang,
    }

    /// Replays scripted replies; once the script is exhausted it repeats the
    /// fallback reply forever.
    struct ScriptedNarrator {
        script: Mutex<VecDeque<Scripted>>,
        fallback: Option<ToolCall>,
        calls: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedNarrator {
        fn new(script: Vec<Scripted>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn always_tool(call: ToolCall) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback: Some(call),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl NarratorClient for ScriptedNarrator {
        async fn converse(
            &self,
            messages: &[ChatMessage],
            _tools: &[Value],
        ) -> Result<NarratorReply, ModelError> {
            self.calls.lock().unwrap().push(messages.to_vec());
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Scripted::Text(chunks)) => Ok(NarratorReply::chunks(chunks)),
                Some(Scripted::Tools(calls)) => Ok(NarratorReply::ToolCalls(calls)),
                Some(Scripted::Fail(e)) => Err(e),
                Some(Scripted::Broken(chunks, e)) => {
                    let mut items: Vec<Result<String, ModelError>> =
                        chunks.into_iter().map(|c| Ok(c.to_string())).collect();
                    items.push(Err(e));
                    Ok(NarratorReply::Narration(Box::pin(stream::iter(items))))
                }
                Some(Scripted::Hang) => {
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
                None => match &self.fallback {
                    Some(call) => Ok(NarratorReply::ToolCalls(vec![call.clone()])),
                    None => Err(ModelError::Protocol("script exhausted".into())),
                },
            }
        }
    }

    struct FixedRoller(Vec<i64>);

    impl DiceRoller for FixedRoller {
        fn roll(&self, notation: &str) -> Result<RollResult, DiceError> {
            let expr = game_rules::DiceExpr::parse(notation)?;
            Ok(RollResult {
                total: self.0.iter().sum::<i64>() + expr.modifier,
                rolls: self.0.clone(),
                modifier: expr.modifier,
                notation: notation.to_string(),
            })
        }
    }

    fn roll_call() -> ToolCall {
        ToolCall::new(
            "call_1",
            "roll_dice",
            json!({"notation": "1d20+3", "reason": "Perception"}),
        )
    }

    fn test_config() -> LoopConfig {
        LoopConfig {
            max_tool_iterations: 3,
            model_timeout: Duration::from_secs(5),
            model_retries: 2,
            backoff_base: Duration::from_millis(10),
            ..LoopConfig::default()
        }
    }

    fn build(narrator: Arc<ScriptedNarrator>, config: LoopConfig) -> InteractionLoop {
        InteractionLoop::new(
            narrator,
            ToolDispatcher::with_builtins(Duration::from_secs(5)),
            ContextAssembler::with_defaults(),
            Arc::new(FixedRoller(vec![12])),
            config,
        )
    }

    fn new_log() -> (Arc<MemoryStore>, SessionLog) {
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

    fn event_types(log: &SessionLog) -> Vec<EventType> {
        log.query_events(&EventFilter::new())
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    #[tokio::test]
    async fn test_plain_narration_completes() {
        let narrator = Arc::new(ScriptedNarrator::new(vec![Scripted::Text(vec![
            "The door ",
            "is locked.",
        ])]));
        let engine = build(narrator.clone(), test_config());
        let (_store, mut log) = new_log();
        let mut world = WorldState::new();

        let report = engine
            .run_turn(&mut log, &mut world, "I examine the door", &CancellationToken::new())
            .await;

        assert_eq!(report.response(), "The door is locked.");
        assert_eq!(
            report.transitions,
            vec![TurnState::Idle, TurnState::AwaitingModel, TurnState::Done]
        );
        assert_eq!(
            event_types(&log),
            vec![EventType::PlayerAction, EventType::Narration]
        );

        let sent = &narrator.calls.lock().unwrap()[0];
        assert_eq!(sent.last().unwrap().content, "I examine the door");
        assert!(sent[1].content.contains("I examine the door"));
    }

    #[tokio::test]
    async fn test_tool_then_narration() {
        let narrator = Arc::new(ScriptedNarrator::new(vec![
            Scripted::Tools(vec![roll_call()]),
            Scripted::Text(vec!["You spot a hidden latch (15)."]),
        ]));
        let engine = build(narrator.clone(), test_config());
        let (_store, mut log) = new_log();
        let mut world = WorldState::new();

        let report = engine
            .run_turn(&mut log, &mut world, "I search", &CancellationToken::new())
            .await;

        assert!(report.is_completed());
        assert_eq!(report.model_visits(), 2);
        assert_eq!(report.tool_iterations, 1);
        assert_eq!(
            event_types(&log),
            vec![
                EventType::PlayerAction,
                EventType::ToolCall,
                EventType::Narration
            ]
        );

        let second = &narrator.calls.lock().unwrap()[1];
        let tool_msg = second.last().unwrap();
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
        assert!(tool_msg.content.contains("= 15"));
    }

    #[tokio::test]
    async fn test_tool_loop_is_bounded() {
        let narrator = Arc::new(ScriptedNarrator::always_tool(roll_call()));
        let engine = build(narrator.clone(), test_config());
        let (_store, mut log) = new_log();
        let mut world = WorldState::new();

        let report = engine
            .run_turn(&mut log, &mut world, "I keep rolling", &CancellationToken::new())
            .await;

        assert_eq!(report.failure(), Some(TurnFailure::ToolLoopExceeded));
        assert_eq!(report.final_state(), TurnState::Failed);
        assert_eq!(report.tool_iterations, 4);
        assert_eq!(narrator.call_count(), 4);

        let types = event_types(&log);
        assert_eq!(types.iter().filter(|t| **t == EventType::ToolCall).count(), 3);
        assert_eq!(types.last(), Some(&EventType::System));
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_errors_are_retried() {
        let narrator = Arc::new(ScriptedNarrator::new(vec![
            Scripted::Fail(ModelError::Communication("reset".into())),
            Scripted::Fail(ModelError::Communication("reset".into())),
            Scripted::Text(vec!["Finally."]),
        ]));
        let engine = build(narrator.clone(), test_config());
        let (_store, mut log) = new_log();
        let mut world = WorldState::new();

        let report = engine
            .run_turn(&mut log, &mut world, "Hello?", &CancellationToken::new())
            .await;
        assert!(report.is_completed());
        assert_eq!(narrator.call_count(), 3);
        // Retries stay inside a single AwaitingModel visit.
        assert_eq!(report.model_visits(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_errors_exhaust_retries() {
        let narrator = Arc::new(ScriptedNarrator::new(vec![
            Scripted::Fail(ModelError::Communication("down".into())),
            Scripted::Fail(ModelError::Communication("down".into())),
            Scripted::Fail(ModelError::Communication("down".into())),
            Scripted::Text(vec!["too late"]),
        ]));
        let engine = build(narrator.clone(), test_config());
        let (_store, mut log) = new_log();
        let mut world = WorldState::new();

        let report = engine
            .run_turn(&mut log, &mut world, "Hello?", &CancellationToken::new())
            .await;
        assert_eq!(report.failure(), Some(TurnFailure::ModelCommunication));
        assert_eq!(narrator.call_count(), 3);
        assert_eq!(
            event_types(&log),
            vec![EventType::PlayerAction, EventType::System]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_timeout_counts_as_failure() {
        let narrator = Arc::new(ScriptedNarrator::new(vec![
            Scripted::Hang,
            Scripted::Text(vec!["Back again."]),
        ]));
        let engine = build(narrator.clone(), test_config());
        let (_store, mut log) = new_log();
        let mut world = WorldState::new();

        let report = engine
            .run_turn(&mut log, &mut world, "Hello?", &CancellationToken::new())
            .await;
        assert!(report.is_completed());
        assert_eq!(narrator.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_is_not_retried() {
        let narrator = Arc::new(ScriptedNarrator::new(vec![
            Scripted::Broken(vec!["The bridge "], ModelError::Communication("eof".into())),
            Scripted::Text(vec!["should never be used"]),
        ]));
        let engine = build(narrator.clone(), test_config());
        let (_store, mut log) = new_log();
        let mut world = WorldState::new();
        let (tx, mut rx) = mpsc::channel(16);

        let report = engine
            .run_turn_streaming(&mut log, &mut world, "I cross", &CancellationToken::new(), &tx)
            .await;
        drop(tx);

        assert_eq!(report.failure(), Some(TurnFailure::ModelCommunication));
        assert_eq!(narrator.call_count(), 1);
        assert_eq!(
            rx.recv().await,
            Some(TurnUpdate::Narration {
                text: "The bridge ".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_streaming_publishes_tool_activity() {
        let narrator = Arc::new(ScriptedNarrator::new(vec![
            Scripted::Tools(vec![roll_call()]),
            Scripted::Text(vec!["Fifteen! ", "You notice it."]),
        ]));
        let engine = build(narrator, test_config());
        let (_store, mut log) = new_log();
        let mut world = WorldState::new();
        let (tx, mut rx) = mpsc::channel(16);

        let report = engine
            .run_turn_streaming(&mut log, &mut world, "I look", &CancellationToken::new(), &tx)
            .await;
        drop(tx);
        assert!(report.is_completed());

        let mut updates = Vec::new();
        while let Some(update) = rx.recv().await {
            updates.push(update);
        }
        assert_eq!(updates.len(), 4);
        assert!(matches!(&updates[0], TurnUpdate::ToolCall { name, .. } if name == "roll_dice"));
        assert!(matches!(&updates[1], TurnUpdate::ToolResult { ok: true, .. }));
        assert_eq!(
            updates[3],
            TurnUpdate::Narration {
                text: "You notice it.".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_model() {
        let narrator = Arc::new(ScriptedNarrator::new(vec![Scripted::Hang]));
        let engine = build(narrator, test_config());
        let (_store, mut log) = new_log();
        let mut world = WorldState::new();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let report = engine
            .run_turn(&mut log, &mut world, "Wait", &cancel)
            .await;
        assert_eq!(report.failure(), Some(TurnFailure::Cancelled));
        // The player action stays logged.
        assert_eq!(
            event_types(&log),
            vec![EventType::PlayerAction, EventType::System]
        );
    }

    #[tokio::test]
    async fn test_cancel_before_first_dispatch() {
        struct CancelAfterReply {
            inner: ScriptedNarrator,
            cancel: CancellationToken,
        }

        #[async_trait]
        impl NarratorClient for CancelAfterReply {
            async fn converse(
                &self,
                messages: &[ChatMessage],
                tools: &[Value],
            ) -> Result<NarratorReply, ModelError> {
                let reply = self.inner.converse(messages, tools).await;
                self.cancel.cancel();
                reply
            }
        }

        let cancel = CancellationToken::new();
        let narrator = Arc::new(CancelAfterReply {
            inner: ScriptedNarrator::new(vec![Scripted::Tools(vec![roll_call(), roll_call()])]),
            cancel: cancel.clone(),
        });
        let engine = InteractionLoop::new(
            narrator,
            ToolDispatcher::with_builtins(Duration::from_secs(5)),
            ContextAssembler::with_defaults(),
            Arc::new(StandardRoller::seeded(3)),
            test_config(),
        );
        let (_store, mut log) = new_log();
        let mut world = WorldState::new();

        let report = engine.run_turn(&mut log, &mut world, "Go", &cancel).await;
        assert_eq!(report.failure(), Some(TurnFailure::Cancelled));
        assert_eq!(
            report.transitions,
            vec![
                TurnState::Idle,
                TurnState::AwaitingModel,
                TurnState::ExecutingTools,
                TurnState::Failed
            ]
        );
        assert!(log
            .query_events(&EventFilter::new().of_type(EventType::ToolCall))
            .is_empty());
    }

    #[tokio::test]
    async fn test_cancel_between_tool_calls_keeps_completed_effects() {
        /// Cancels the turn as soon as it has produced a roll.
        struct CancellingRoller {
            inner: FixedRoller,
            cancel: CancellationToken,
        }

        impl DiceRoller for CancellingRoller {
            fn roll(&self, notation: &str) -> Result<RollResult, DiceError> {
                let result = self.inner.roll(notation);
                self.cancel.cancel();
                result
            }
        }

        let cancel = CancellationToken::new();
        let second = ToolCall::new(
            "call_2",
            "roll_dice",
            json!({"notation": "1d6", "reason": "Damage"}),
        );
        let narrator = Arc::new(ScriptedNarrator::new(vec![Scripted::Tools(vec![
            roll_call(),
            second,
        ])]));
        let engine = InteractionLoop::new(
            narrator,
            ToolDispatcher::with_builtins(Duration::from_secs(5)),
            ContextAssembler::with_defaults(),
            Arc::new(CancellingRoller {
                inner: FixedRoller(vec![12]),
                cancel: cancel.clone(),
            }),
            test_config(),
        );
        let (store, mut log) = new_log();
        let mut world = WorldState::new();

        let report = engine.run_turn(&mut log, &mut world, "Go", &cancel).await;
        assert_eq!(report.failure(), Some(TurnFailure::Cancelled));
        assert_eq!(report.final_state(), TurnState::Failed);

        let reloaded = SessionLog::load(store, log.id()).unwrap();
        let calls = reloaded.query_events(&EventFilter::new().of_type(EventType::ToolCall));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].metadata["tool"].as_str(), Some("roll_dice"));
        assert_eq!(calls[0].metadata["notation"].as_str(), Some("1d20+3"));
        assert_eq!(calls[0].metadata["total"].as_int(), Some(15));
        assert_eq!(reloaded.session(), log.session());
    }

    #[tokio::test]
    async fn test_narration_after_end_scene_opens_follow_on_scene() {
        let narrator = Arc::new(ScriptedNarrator::new(vec![
            Scripted::Tools(vec![ToolCall::new(
                "call_1",
                "end_scene",
                json!({"summary": "Ralph paid his tab and left."}),
            )]),
            Scripted::Text(vec!["You step out into the rain."]),
        ]));
        let engine = build(narrator, test_config());
        let (store, mut log) = new_log();
        let mut world = WorldState::new();

        let report = engine
            .run_turn(&mut log, &mut world, "I leave", &CancellationToken::new())
            .await;

        assert!(report.is_completed());
        assert_eq!(report.response(), "You step out into the rain.");

        let scenes = log.scenes();
        assert_eq!(scenes.len(), 2);
        assert!(!scenes[0].active);
        assert_eq!(scenes[0].summary.as_deref(), Some("Ralph paid his tab and left."));
        assert_eq!(scenes[1].title, "Tavern (continued)");
        assert_eq!(scenes[1].location, "The Shrouded Flagon");

        let reloaded = SessionLog::load(store, log.id()).unwrap();
        let narration = reloaded.query_events(&EventFilter::new().of_type(EventType::Narration));
        assert_eq!(narration.len(), 1);
        assert_eq!(narration[0].content, "You step out into the rain.");
    }

    #[tokio::test]
    async fn test_narration_after_end_scene_without_auto_open() {
        let narrator = Arc::new(ScriptedNarrator::new(vec![
            Scripted::Tools(vec![ToolCall::new(
                "call_1",
                "end_scene",
                json!({"summary": "Done."}),
            )]),
            Scripted::Text(vec!["You step out into the rain."]),
        ]));
        let engine = build(
            narrator,
            LoopConfig {
                auto_open_scene: false,
                ..test_config()
            },
        );
        let (_store, mut log) = new_log();
        let mut world = WorldState::new();

        let report = engine
            .run_turn(&mut log, &mut world, "I leave", &CancellationToken::new())
            .await;
        assert_eq!(report.failure(), Some(TurnFailure::NoActiveScene));
        assert_eq!(log.scenes().len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_fails_turn() {
        let narrator = Arc::new(ScriptedNarrator::new(vec![Scripted::Text(vec!["Hi."])]));
        let engine = build(narrator.clone(), test_config());
        let (store, mut log) = new_log();
        let mut world = WorldState::new();
        store.set_reject_writes(true);

        let report = engine
            .run_turn(&mut log, &mut world, "Hello", &CancellationToken::new())
            .await;
        assert_eq!(report.failure(), Some(TurnFailure::Persistence));
        assert_eq!(narrator.call_count(), 0);
        assert_eq!(log.session().event_count(), 0);
    }

    #[tokio::test]
    async fn test_scene_opened_when_missing() {
        let narrator = Arc::new(ScriptedNarrator::new(vec![Scripted::Text(vec!["Welcome."])]));
        let engine = build(narrator, test_config());
        let mut log = SessionLog::create(Arc::new(MemoryStore::new())).unwrap();
        let mut world = WorldState::new();

        let report = engine
            .run_turn(&mut log, &mut world, "Begin", &CancellationToken::new())
            .await;
        assert!(report.is_completed());
        assert_eq!(log.active_scene().unwrap().title, AUTO_SCENE_TITLE);
    }

    #[tokio::test]
    async fn test_no_scene_without_auto_open() {
        let narrator = Arc::new(ScriptedNarrator::new(vec![Scripted::Text(vec!["Welcome."])]));
        let engine = build(
            narrator,
            LoopConfig {
                auto_open_scene: false,
                ..test_config()
            },
        );
        let mut log = SessionLog::create(Arc::new(MemoryStore::new())).unwrap();
        let mut world = WorldState::new();

        let report = engine
            .run_turn(&mut log, &mut world, "Begin", &CancellationToken::new())
            .await;
        assert_eq!(report.failure(), Some(TurnFailure::NoActiveScene));
        assert!(log.scenes().is_empty());
    }

    #[tokio::test]
    async fn test_campaign_briefing_sent_to_narrator() {
        let narrator = Arc::new(ScriptedNarrator::new(vec![Scripted::Text(vec!["Ok."])]));
        let engine = build(narrator.clone(), test_config());
        let (_store, mut log) = new_log();
        let mut world = WorldState::campaign("Ashes of Varn", "A fallen kingdom");

        engine
            .run_turn(&mut log, &mut world, "Hi", &CancellationToken::new())
            .await;
        let sent = &narrator.calls.lock().unwrap()[0];
        assert!(sent.iter().any(|m| m.content.contains("Ashes of Varn")));
    }
}
