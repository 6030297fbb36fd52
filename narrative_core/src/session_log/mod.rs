//! Session Log - the Session → Scene → Event hierarchy and its durability.
//!
//! The log is the single writer for its session record. Every mutation is
//! applied to a copy of the session, durably written, and only then made
//! visible, so a failed write leaves the log exactly as it was last persisted.
//!
//! - At most one scene is active at a time.
//! - Events are appended to the active scene only and never change afterwards.
//! - A closed scene only ever gains a summary, once.

mod model;
mod query;
mod store;

pub use model::*;
pub use query::*;
pub use store::*;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::{SessionError, StoreError};

/// Aggregate statistics over a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub scene_count: usize,
    pub closed_scene_count: usize,
    pub event_count: usize,
    pub active_scene_id: Option<SceneId>,
    pub active_scene_title: Option<String>,
    pub events_by_type: BTreeMap<EventType, usize>,
}

/// Owner of one session's hierarchy and its durable record.
pub struct SessionLog {
    session: Session,
    store: Arc<dyn SessionStore>,
}

impl std::fmt::Debug for SessionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLog")
            .field("session_id", &self.session.id)
            .field("scenes", &self.session.scenes.len())
            .finish()
    }
}

impl SessionLog {
    /// Start a new, empty session and persist it.
    pub fn create(store: Arc<dyn SessionStore>) -> Result<Self, SessionError> {
        let session = Session::new(SessionId::new(), Utc::now());
        store.save(&session).map_err(persistence_error)?;
        info!(session_id = %session.id, "created session");
        Ok(Self { session, store })
    }

    /// Start a new session with an opening scene already active.
    pub fn create_with_opening_scene(
        store: Arc<dyn SessionStore>,
        title: impl Into<String>,
        location: impl Into<String>,
        participants: impl IntoIterator<Item = String>,
    ) -> Result<Self, SessionError> {
        let mut log = Self::create(store)?;
        log.start_scene(title, location, participants)?;
        Ok(log)
    }

    /// Reconstruct a session from durable storage.
    ///
    /// Fails with `NotFound` when there is no record and `Corruption` when the
    /// record cannot be parsed into a structurally valid session.
    pub fn load(store: Arc<dyn SessionStore>, id: SessionId) -> Result<Self, SessionError> {
        let session = match store.load(id) {
            Ok(Some(session)) => session,
            Ok(None) => return Err(SessionError::NotFound(id)),
            Err(StoreError::Unparseable(reason)) => {
                return Err(SessionError::Corruption {
                    session_id: id,
                    reason,
                })
            }
            Err(e) => return Err(persistence_error(e)),
        };

        if session.id != id {
            return Err(SessionError::Corruption {
                session_id: id,
                reason: format!("record belongs to session {}", session.id),
            });
        }
        session
            .validate()
            .map_err(|reason| SessionError::Corruption {
                session_id: id,
                reason,
            })?;

        info!(session_id = %id, scenes = session.scenes.len(), "loaded session");
        Ok(Self { session, store })
    }

    /// Write the full session record.
    pub fn save(&self) -> Result<(), SessionError> {
        self.store.save(&self.session).map_err(persistence_error)
    }

    pub fn id(&self) -> SessionId {
        self.session.id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// An owned, consistent copy for readers outside the owning turn.
    pub fn snapshot(&self) -> Session {
        self.session.clone()
    }

    pub fn scenes(&self) -> &[Scene] {
        &self.session.scenes
    }

    pub fn scene(&self, id: SceneId) -> Option<&Scene> {
        self.session.scene(id)
    }

    pub fn active_scene(&self) -> Option<&Scene> {
        self.session.active_scene()
    }

    /// Open a new scene. Fails if one is already active.
    pub fn start_scene(
        &mut self,
        title: impl Into<String>,
        location: impl Into<String>,
        participants: impl IntoIterator<Item = String>,
    ) -> Result<SceneId, SessionError> {
        let title = title.into();
        let location = location.into();
        let participants: BTreeSet<String> = participants.into_iter().collect();

        let id = self.commit(|session| {
            if let Some(active) = session.active_scene() {
                return Err(SessionError::validation(format!(
                    "{} ('{}') is still active; end it before starting another",
                    active.id, active.title
                )));
            }

            let id = session.next_scene_id();
            let floor = session.scenes.last().map(|s| s.last_activity());
            let started_at = clamp_after(Utc::now(), floor);
            session.scenes.push(Scene {
                id,
                title: title.clone(),
                location: location.clone(),
                participants,
                started_at,
                ended_at: None,
                active: true,
                summary: None,
                events: Vec::new(),
            });
            session.active_scene_id = Some(id);
            Ok(id)
        })?;

        info!(session_id = %self.session.id, scene_id = %id, %title, %location, "scene started");
        Ok(id)
    }

    /// Close the active scene with an optional summary.
    pub fn end_scene(&mut self, summary: Option<String>) -> Result<SceneId, SessionError> {
        let id = self.commit(|session| close_active(session, summary))?;
        info!(session_id = %self.session.id, scene_id = %id, "scene ended");
        Ok(id)
    }

    /// Append `record` to the active scene and close it, in one durable write.
    pub fn end_scene_with_record(
        &mut self,
        summary: Option<String>,
        record: NewEvent,
    ) -> Result<(SceneId, EventId), SessionError> {
        let (id, event_id) = self.commit(|session| {
            let event_id = append_to_active(session, record)?;
            let id = close_active(session, summary)?;
            Ok((id, event_id))
        })?;
        info!(session_id = %self.session.id, scene_id = %id, "scene ended");
        Ok((id, event_id))
    }

    /// Append an event to the active scene.
    pub fn log_event(
        &mut self,
        event_type: EventType,
        actor: impl Into<String>,
        content: impl Into<String>,
        metadata: Metadata,
    ) -> Result<EventId, SessionError> {
        self.append(NewEvent::new(event_type, actor, content).with_metadata(metadata))
    }

    /// Append a prepared event to the active scene.
    pub fn append(&mut self, record: NewEvent) -> Result<EventId, SessionError> {
        let event_type = record.event_type;
        let id = self.commit(|session| append_to_active(session, record))?;
        debug!(session_id = %self.session.id, event_id = %id, %event_type, "event logged");
        Ok(id)
    }

    /// Attach a summary to a closed scene that has none.
    ///
    /// Re-attaching identical text is a no-op.
    pub fn attach_summary(
        &mut self,
        scene_id: SceneId,
        summary: impl Into<String>,
    ) -> Result<(), SessionError> {
        let summary = summary.into();
        let scene = self
            .session
            .scene(scene_id)
            .ok_or_else(|| SessionError::validation(format!("{} does not exist", scene_id)))?;
        if scene.active {
            return Err(SessionError::validation(format!(
                "{} is still active; summaries attach to closed scenes",
                scene_id
            )));
        }
        match &scene.summary {
            Some(existing) if *existing == summary => return Ok(()),
            Some(_) => {
                return Err(SessionError::validation(format!(
                    "{} already has a summary",
                    scene_id
                )))
            }
            None => {}
        }

        self.commit(|session| {
            if let Some(scene) = session.scene_mut(scene_id) {
                scene.summary = Some(summary);
            }
            Ok(())
        })
    }

    /// Events matching every predicate of `filter`, in chronological order.
    pub fn query_events(&self, filter: &EventFilter) -> Vec<&Event> {
        self.session
            .scenes
            .iter()
            .flat_map(|scene| {
                scene
                    .events
                    .iter()
                    .filter(move |event| filter.matches(scene.id, event))
            })
            .collect()
    }

    pub fn summary(&self) -> SessionSummary {
        let mut events_by_type = BTreeMap::new();
        for event in self.session.scenes.iter().flat_map(|s| s.events.iter()) {
            *events_by_type.entry(event.event_type).or_insert(0) += 1;
        }

        let active = self.session.active_scene();
        SessionSummary {
            session_id: self.session.id,
            created_at: self.session.created_at,
            scene_count: self.session.scenes.len(),
            closed_scene_count: self.session.scenes.iter().filter(|s| !s.active).count(),
            event_count: self.session.event_count(),
            active_scene_id: active.map(|s| s.id),
            active_scene_title: active.map(|s| s.title.clone()),
            events_by_type,
        }
    }

    /// Apply `change` to a copy of the session, persist it, then install it.
    fn commit<T>(
        &mut self,
        change: impl FnOnce(&mut Session) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let mut next = self.session.clone();
        let out = change(&mut next)?;

        if let Err(e) = self.store.save(&next) {
            error!(session_id = %self.session.id, error = %e, "failed to persist session");
            return Err(persistence_error(e));
        }

        self.session = next;
        Ok(out)
    }
}

fn persistence_error(e: StoreError) -> SessionError {
    SessionError::Persistence(e.to_string())
}

/// `now`, or `floor` if the clock reads earlier than it.
fn clamp_after(now: DateTime<Utc>, floor: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match floor {
        Some(floor) if floor > now => floor,
        _ => now,
    }
}

fn append_to_active(session: &mut Session, record: NewEvent) -> Result<EventId, SessionError> {
    validate_metadata(record.event_type, &record.metadata).map_err(SessionError::Validation)?;

    let id = session.next_event_id();
    let scene = session
        .active_scene_mut()
        .ok_or_else(|| SessionError::validation("no scene is active"))?;

    scene.events.push(Event {
        id,
        timestamp: clamp_after(Utc::now(), Some(scene.last_activity())),
        event_type: record.event_type,
        actor: record.actor,
        content: record.content,
        metadata: record.metadata,
    });
    Ok(id)
}

fn close_active(session: &mut Session, summary: Option<String>) -> Result<SceneId, SessionError> {
    let scene = session
        .active_scene_mut()
        .ok_or_else(|| SessionError::validation("no scene is active"))?;
    scene.ended_at = Some(clamp_after(Utc::now(), Some(scene.last_activity())));
    scene.active = false;
    scene.summary = summary.filter(|s| !s.trim().is_empty());
    let id = scene.id;

    session.active_scene_id = None;
    Ok(id)
}
