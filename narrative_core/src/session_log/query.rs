//! Event queries.

use chrono::{DateTime, Utc};

use super::{Event, EventType, SceneId};

/// Inclusive time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn since(from: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: None,
        }
    }

    pub fn until(to: DateTime<Utc>) -> Self {
        Self {
            from: None,
            to: Some(to),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at <= to)
    }
}

/// Predicates combined with AND semantics. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub event_type: Option<EventType>,
    pub actor: Option<String>,
    pub scene_id: Option<SceneId>,
    pub time_range: Option<TimeRange>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn by_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn in_scene(mut self, scene_id: SceneId) -> Self {
        self.scene_id = Some(scene_id);
        self
    }

    pub fn within(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }

    /// Whether `event`, belonging to `scene_id`, satisfies every predicate.
    pub fn matches(&self, scene_id: SceneId, event: &Event) -> bool {
        if self.scene_id.is_some_and(|id| id != scene_id) {
            return false;
        }
        if self.event_type.is_some_and(|t| t != event.event_type) {
            return false;
        }
        if let Some(actor) = &self.actor {
            if actor != &event.actor {
                return false;
            }
        }
        if let Some(range) = &self.time_range {
            if !range.contains(event.timestamp) {
                return false;
            }
        }
        true
    }
}
