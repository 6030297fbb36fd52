//! Built-in tools: dice, scene control, event logging and campaign tracking.

use async_trait::async_trait;
use game_rules::{roll_with_mode, Location, NpcProfile, PlotStatus, RollMode};
use serde_json::json;
use std::sync::Arc;

use super::{ArgSchema, ArgType, LogPolicy, ToolArgs, ToolContext, ToolHandler, ToolOutput, ToolSpec};
use crate::error::HandlerError;
use crate::session_log::{EventType, MetaValue};

/// Every built-in tool, ready to register.
pub fn builtin_tools() -> Vec<ToolSpec> {
    let event_types: Vec<&str> = EventType::ALL.iter().map(|t| t.as_str()).collect();

    vec![
        ToolSpec::new(
            "roll_dice",
            "Roll dice using standard notation (d20, 2d6+3, 4d6kh3). Narrate the outcome afterwards.",
            ArgSchema::new()
                .required("notation", ArgType::String, "Dice notation, e.g. '1d20+3'")
                .required("reason", ArgType::String, "What the roll is for, e.g. 'Perception check'")
                .optional(
                    "roll_type",
                    ArgType::one_of(["normal", "advantage", "disadvantage"]),
                    "Roll mode (default: normal)",
                ),
            Arc::new(RollDice),
        ),
        ToolSpec::new(
            "start_scene",
            "Begin a new scene when the location or situation changes significantly.",
            ArgSchema::new()
                .required("title", ArgType::String, "Scene title")
                .required("location", ArgType::String, "Where the scene takes place")
                .optional("participants", ArgType::StringArray, "Characters present"),
            Arc::new(StartScene),
        ),
        ToolSpec::new(
            "end_scene",
            "End the current scene with an optional short summary.",
            ArgSchema::new().optional(
                "summary",
                ArgType::String,
                "What happened in this scene (2-3 sentences)",
            ),
            Arc::new(EndScene),
        )
        .with_log_policy(LogPolicy::InClosingScene),
        ToolSpec::new(
            "log_event",
            "Record an important event, state change or significant moment.",
            ArgSchema::new()
                .required("event_type", ArgType::one_of(event_types), "Type of event")
                .required("content", ArgType::String, "What happened")
                .optional("actor", ArgType::String, "Who did it (default: system)"),
            Arc::new(LogEvent),
        ),
        ToolSpec::new(
            "track_npc",
            "Track or update a significant NPC.",
            ArgSchema::new()
                .required("name", ArgType::String, "NPC name")
                .required("description", ArgType::String, "Appearance and personality")
                .optional("role", ArgType::String, "e.g. 'quest giver', 'merchant'")
                .optional("knowledge", ArgType::StringArray, "New things this NPC knows")
                .optional("location", ArgType::String, "Where the NPC was last seen"),
            Arc::new(TrackNpc),
        ),
        ToolSpec::new(
            "track_location",
            "Track or update an important location.",
            ArgSchema::new()
                .required("name", ArgType::String, "Location name")
                .required("description", ArgType::String, "Location description")
                .optional("event", ArgType::String, "Notable event that just happened here"),
            Arc::new(TrackLocation),
        ),
        ToolSpec::new(
            "add_plot_thread",
            "Create a plot thread when a new story arc or quest begins.",
            ArgSchema::new()
                .required("title", ArgType::String, "Plot thread title")
                .required("description", ArgType::String, "What the thread is about")
                .optional("related_npcs", ArgType::StringArray, "NPCs involved"),
            Arc::new(AddPlotThread),
        ),
        ToolSpec::new(
            "update_plot_thread",
            "Record a development in an existing plot thread.",
            ArgSchema::new()
                .required("title", ArgType::String, "Title of the thread to update")
                .required("update", ArgType::String, "What happened")
                .optional(
                    "status",
                    ArgType::one_of(["active", "completed", "abandoned", "on_hold"]),
                    "New status, if it changed",
                ),
            Arc::new(UpdatePlotThread),
        ),
    ]
}

fn required<'a>(args: &'a ToolArgs, key: &str) -> Result<&'a str, HandlerError> {
    args.text(key)
        .ok_or_else(|| HandlerError::failed(format!("missing argument '{}'", key)))
}

pub struct RollDice;

#[async_trait]
impl ToolHandler for RollDice {
    async fn call(
        &self,
        ctx: &mut ToolContext<'_>,
        args: &ToolArgs,
    ) -> Result<ToolOutput, HandlerError> {
        let notation = required(args, "notation")?;
        let reason = required(args, "reason")?;
        let mode = args
            .text("roll_type")
            .and_then(RollMode::parse)
            .unwrap_or_default();

        let (kept, discarded) = roll_with_mode(ctx.roller, notation, mode)?;

        let mut message = format!("{}: {}", reason, kept.details());
        if let Some(other) = &discarded {
            message.push_str(&format!(" ({}, other roll {})", mode.as_str(), other.total));
        }

        Ok(ToolOutput::new(message)
            .with_data(json!({
                "total": kept.total,
                "rolls": kept.rolls,
                "modifier": kept.modifier,
                "notation": kept.notation,
                "roll_type": mode.as_str(),
                "discarded_total": discarded.map(|d| d.total),
            }))
            .with_meta("notation", kept.notation.as_str())
            .with_meta("total", kept.total)
            .with_meta("rolls", kept.rolls.clone())
            .with_meta("roll_type", mode.as_str())
            .with_meta("reason", reason))
    }
}

pub struct StartScene;

#[async_trait]
impl ToolHandler for StartScene {
    async fn call(
        &self,
        ctx: &mut ToolContext<'_>,
        args: &ToolArgs,
    ) -> Result<ToolOutput, HandlerError> {
        let title = required(args, "title")?;
        let location = required(args, "location")?;
        let participants = args.text_list("participants");

        let id = ctx.log.start_scene(title, location, participants)?;
        Ok(
            ToolOutput::new(format!("Started scene '{}' at {} ({})", title, location, id))
                .with_data(json!({ "scene_id": id.0 })),
        )
    }
}

pub struct EndScene;

#[async_trait]
impl ToolHandler for EndScene {
    async fn call(
        &self,
        ctx: &mut ToolContext<'_>,
        args: &ToolArgs,
    ) -> Result<ToolOutput, HandlerError> {
        let summary = args.text("summary").map(str::to_string);
        let (scene_id, title) = ctx
            .log
            .active_scene()
            .map(|s| (s.id, s.title.clone()))
            .ok_or_else(|| HandlerError::failed("no active scene to end"))?;

        let output = ToolOutput::new(format!(
            "Ended scene '{}'. Summary: {}",
            title,
            summary.as_deref().unwrap_or("none")
        ))
        .with_data(json!({ "scene_id": scene_id.0 }));

        match ctx.take_audit_record(&output) {
            Some(record) => {
                ctx.log.end_scene_with_record(summary, record)?;
            }
            None => {
                ctx.log.end_scene(summary)?;
            }
        }
        Ok(output)
    }
}

pub struct LogEvent;

#[async_trait]
impl ToolHandler for LogEvent {
    async fn call(
        &self,
        ctx: &mut ToolContext<'_>,
        args: &ToolArgs,
    ) -> Result<ToolOutput, HandlerError> {
        let raw_type = required(args, "event_type")?;
        let event_type = EventType::parse(raw_type)
            .ok_or_else(|| HandlerError::failed(format!("unknown event type '{}'", raw_type)))?;
        let content = required(args, "content")?;
        let actor = args.text("actor").unwrap_or("system");

        let id = ctx
            .log
            .log_event(event_type, actor, content, Default::default())?;
        Ok(
            ToolOutput::new(format!("Logged {} event ({})", event_type, id))
                .with_data(json!({ "event_id": id.0 })),
        )
    }
}

pub struct TrackNpc;

#[async_trait]
impl ToolHandler for TrackNpc {
    async fn call(
        &self,
        ctx: &mut ToolContext<'_>,
        args: &ToolArgs,
    ) -> Result<ToolOutput, HandlerError> {
        let name = required(args, "name")?;
        let description = required(args, "description")?;
        let session = ctx.session_label();

        let is_new = ctx.world.npc(name).is_none();
        if is_new {
            let mut npc = NpcProfile::new(name, description);
            npc.first_appeared_session = Some(session.clone());
            npc.last_seen_session = Some(session.clone());
            ctx.world.upsert_npc(npc);
        }
        let npc = ctx
            .world
            .npc_mut(name)
            .ok_or_else(|| HandlerError::failed(format!("NPC '{}' vanished", name)))?;

        npc.description = description.to_string();
        if let Some(role) = args.text("role") {
            npc.role = Some(role.to_string());
        }
        for item in args.text_list("knowledge") {
            npc.add_knowledge(item);
        }
        if let Some(location) = args.text("location") {
            npc.seen_at(location, session);
        }

        let verb = if is_new { "Tracked new" } else { "Updated" };
        Ok(ToolOutput::new(format!("{} NPC '{}'", verb, name))
            .with_meta("npc", name)
            .with_meta("created", is_new))
    }
}

pub struct TrackLocation;

#[async_trait]
impl ToolHandler for TrackLocation {
    async fn call(
        &self,
        ctx: &mut ToolContext<'_>,
        args: &ToolArgs,
    ) -> Result<ToolOutput, HandlerError> {
        let name = required(args, "name")?;
        let description = required(args, "description")?;
        let session = ctx.session_label();

        let is_new = ctx.world.location(name).is_none();
        if is_new {
            ctx.world.upsert_location(Location::new(name, description));
        }
        let location = ctx
            .world
            .location_mut(name)
            .ok_or_else(|| HandlerError::failed(format!("location '{}' vanished", name)))?;

        location.description = description.to_string();
        if let Some(event) = args.text("event") {
            location.add_event(event);
        }
        location.visit(session);

        let verb = if is_new { "Tracked new" } else { "Updated" };
        Ok(ToolOutput::new(format!("{} location '{}'", verb, name))
            .with_meta("location", name)
            .with_meta("created", is_new))
    }
}

pub struct AddPlotThread;

#[async_trait]
impl ToolHandler for AddPlotThread {
    async fn call(
        &self,
        ctx: &mut ToolContext<'_>,
        args: &ToolArgs,
    ) -> Result<ToolOutput, HandlerError> {
        let title = required(args, "title")?;
        let description = required(args, "description")?;
        let session = ctx.session_label();

        let id = ctx.world.add_plot_thread(
            title,
            description,
            args.text_list("related_npcs"),
            session,
        );
        Ok(
            ToolOutput::new(format!("Added plot thread '{}' ({})", title, id))
                .with_meta("plot_id", id.as_str()),
        )
    }
}

pub struct UpdatePlotThread;

#[async_trait]
impl ToolHandler for UpdatePlotThread {
    async fn call(
        &self,
        ctx: &mut ToolContext<'_>,
        args: &ToolArgs,
    ) -> Result<ToolOutput, HandlerError> {
        let title = required(args, "title")?;
        let update = required(args, "update")?;
        let status = args.text("status").and_then(PlotStatus::parse);
        let session = ctx.session_label();

        let thread = ctx
            .world
            .plot_thread_by_title_mut(title)
            .ok_or_else(|| HandlerError::failed(format!("plot thread '{}' not found", title)))?;
        thread.add_update(session, update);
        if let Some(status) = status {
            thread.status = status;
        }

        Ok(
            ToolOutput::new(format!("Updated plot thread '{}': {}", title, update))
                .with_meta("plot_id", MetaValue::Text(thread.id.clone())),
        )
    }
}
