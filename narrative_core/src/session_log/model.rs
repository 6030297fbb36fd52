//! Session, Scene and Event records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a session (one play-through).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of a scene, unique within its session.
///
/// Scenes are numbered from 1 in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SceneId(pub u32);

impl std::fmt::Display for SceneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scene-{}", self.0)
    }
}

/// Identifier of an event, unique and increasing across its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "event-{}", self.0)
    }
}

/// The closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Narration,
    PlayerAction,
    DiceRoll,
    NpcAction,
    NpcDialogue,
    System,
    ToolCall,
    StateChange,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        EventType::Narration,
        EventType::PlayerAction,
        EventType::DiceRoll,
        EventType::NpcAction,
        EventType::NpcDialogue,
        EventType::System,
        EventType::ToolCall,
        EventType::StateChange,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Narration => "narration",
            EventType::PlayerAction => "player_action",
            EventType::DiceRoll => "dice_roll",
            EventType::NpcAction => "npc_action",
            EventType::NpcDialogue => "npc_dialogue",
            EventType::System => "system",
            EventType::ToolCall => "tool_call",
            EventType::StateChange => "state_change",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == raw)
    }

    /// Metadata keys (and their kinds) every event of this type must carry.
    pub fn required_metadata(&self) -> &'static [(&'static str, MetaKind)] {
        match self {
            EventType::DiceRoll => &[("notation", MetaKind::Text), ("total", MetaKind::Int)],
            EventType::ToolCall => &[("tool", MetaKind::Text), ("outcome", MetaKind::Text)],
            _ => &[],
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<MetaValue>),
    Map(BTreeMap<String, MetaValue>),
}

/// Kind tag used when validating metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    Int,
    Text,
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            MetaValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    fn is_kind(&self, kind: MetaKind) -> bool {
        match kind {
            MetaKind::Int => matches!(self, MetaValue::Int(_)),
            MetaKind::Text => matches!(self, MetaValue::Text(_)),
        }
    }

    /// Convert from an arbitrary JSON value.
    pub fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => MetaValue::Null,
            Value::Bool(b) => MetaValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => MetaValue::Int(i),
                None => MetaValue::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => MetaValue::Text(s.clone()),
            Value::Array(items) => MetaValue::List(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => MetaValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            MetaValue::Null => Value::Null,
            MetaValue::Bool(b) => Value::Bool(*b),
            MetaValue::Int(i) => Value::from(*i),
            MetaValue::Float(f) => Value::from(*f),
            MetaValue::Text(s) => Value::String(s.clone()),
            MetaValue::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            MetaValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Text(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Text(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Int(value)
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        MetaValue::Bool(value)
    }
}

impl From<Vec<i64>> for MetaValue {
    fn from(value: Vec<i64>) -> Self {
        MetaValue::List(value.into_iter().map(MetaValue::Int).collect())
    }
}

/// Event metadata: ordered so that rendering and persistence are deterministic.
pub type Metadata = BTreeMap<String, MetaValue>;

/// Check that `metadata` carries the keys required for `event_type`.
pub fn validate_metadata(event_type: EventType, metadata: &Metadata) -> Result<(), String> {
    for (key, kind) in event_type.required_metadata() {
        match metadata.get(*key) {
            Some(value) if value.is_kind(*kind) => {}
            Some(_) => {
                return Err(format!(
                    "{} metadata key '{}' must be {:?}",
                    event_type, key, kind
                ))
            }
            None => {
                return Err(format!(
                    "{} event requires metadata key '{}'",
                    event_type, key
                ))
            }
        }
    }
    Ok(())
}

/// An event that has not been appended yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: EventType,
    pub actor: String,
    pub content: String,
    pub metadata: Metadata,
}

impl NewEvent {
    pub fn new(event_type: EventType, actor: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            event_type,
            actor: actor.into(),
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata.extend(metadata);
        self
    }
}

/// An immutable, timestamped fact within a scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub actor: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A bounded narrative unit grouping related events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub id: SceneId,
    pub title: String,
    pub location: String,
    #[serde(default)]
    pub participants: BTreeSet<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub summary: Option<String>,
    #[serde(default)]
    pub events: Vec<Event>,
}

impl Scene {
    /// Timestamp of the last event, or the scene start if it has none.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.events
            .last()
            .map(|e| e.timestamp)
            .unwrap_or(self.started_at)
    }
}

/// The top-level container for one play-through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub active_scene_id: Option<SceneId>,
    /// Scenes in creation order.
    #[serde(default)]
    pub scenes: Vec<Scene>,
}

impl Session {
    /// Create a new empty session.
    pub fn new(id: SessionId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at,
            active_scene_id: None,
            scenes: Vec::new(),
        }
    }

    pub fn scene(&self, id: SceneId) -> Option<&Scene> {
        self.scenes.iter().find(|s| s.id == id)
    }

    pub fn scene_mut(&mut self, id: SceneId) -> Option<&mut Scene> {
        self.scenes.iter_mut().find(|s| s.id == id)
    }

    pub fn active_scene(&self) -> Option<&Scene> {
        self.active_scene_id.and_then(|id| self.scene(id))
    }

    pub fn active_scene_mut(&mut self) -> Option<&mut Scene> {
        let id = self.active_scene_id?;
        self.scene_mut(id)
    }

    pub fn event_count(&self) -> usize {
        self.scenes.iter().map(|s| s.events.len()).sum()
    }

    pub(crate) fn next_scene_id(&self) -> SceneId {
        SceneId(self.scenes.iter().map(|s| s.id.0).max().unwrap_or(0) + 1)
    }

    pub(crate) fn next_event_id(&self) -> EventId {
        let last = self
            .scenes
            .iter()
            .flat_map(|s| s.events.iter())
            .map(|e| e.id.0)
            .max()
            .unwrap_or(0);
        EventId(last + 1)
    }

    /// Check every structural invariant of the session graph.
    pub fn validate(&self) -> Result<(), String> {
        let mut scene_ids = HashSet::new();
        let mut last_event_id: Option<EventId> = None;
        let mut active_count = 0;

        for scene in &self.scenes {
            if !scene_ids.insert(scene.id) {
                return Err(format!("duplicate scene id {}", scene.id));
            }

            if scene.active {
                active_count += 1;
                if scene.ended_at.is_some() {
                    return Err(format!("{} is active but has an end timestamp", scene.id));
                }
            } else {
                match scene.ended_at {
                    None => return Err(format!("{} is inactive but was never closed", scene.id)),
                    Some(end) if end < scene.started_at => {
                        return Err(format!("{} ends before it starts", scene.id))
                    }
                    Some(_) => {}
                }
            }

            let mut previous = scene.started_at;
            for event in &scene.events {
                if event.timestamp < scene.started_at {
                    return Err(format!("{} pre-dates the start of {}", event.id, scene.id));
                }
                if event.timestamp < previous {
                    return Err(format!("{} is out of chronological order", event.id));
                }
                if let Some(end) = scene.ended_at {
                    if event.timestamp > end {
                        return Err(format!("{} post-dates the end of {}", event.id, scene.id));
                    }
                }
                if let Some(last) = last_event_id {
                    if event.id <= last {
                        return Err(format!("{} is not in increasing id order", event.id));
                    }
                }
                validate_metadata(event.event_type, &event.metadata)
                    .map_err(|reason| format!("{}: {}", event.id, reason))?;
                previous = event.timestamp;
                last_event_id = Some(event.id);
            }
        }

        if active_count > 1 {
            return Err(format!("{} scenes are active at once", active_count));
        }

        match self.active_scene_id {
            Some(id) => match self.scene(id) {
                Some(scene) if scene.active => Ok(()),
                Some(_) => Err(format!("active scene id {} points at a closed scene", id)),
                None => Err(format!("active scene id {} does not exist", id)),
            },
            None if active_count == 0 => Ok(()),
            None => Err("a scene is active but no active scene id is recorded".to_string()),
        }
    }
}
