//! World state management - the campaign record shared across play sessions.
//!
//! The narrator core treats this as an opaque game-state store: tool handlers
//! read and update it, but its persistence belongs to the caller.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::entities::{Location, NpcProfile};

/// How many NPCs and locations the briefing lists.
const BRIEFING_NPC_LIMIT: usize = 10;
const BRIEFING_LOCATION_LIMIT: usize = 8;
const BRIEFING_KNOWLEDGE_LIMIT: usize = 3;
const BRIEFING_DESCRIPTION_CHARS: usize = 100;

/// Status of a plot thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlotStatus {
    #[default]
    Active,
    Completed,
    Abandoned,
    OnHold,
}

impl PlotStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(PlotStatus::Active),
            "completed" => Some(PlotStatus::Completed),
            "abandoned" => Some(PlotStatus::Abandoned),
            "on_hold" => Some(PlotStatus::OnHold),
            _ => None,
        }
    }
}

/// A development in a plot thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotUpdate {
    pub session_id: String,
    pub description: String,
}

/// A story arc within the campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotThread {
    /// Sequential identifier, `plot_001`, `plot_002`, ...
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: PlotStatus,
    #[serde(default)]
    pub related_npcs: Vec<String>,
    pub created_in_session: String,
    #[serde(default)]
    pub updates: Vec<PlotUpdate>,
}

impl PlotThread {
    /// Record a development in this thread.
    pub fn add_update(&mut self, session_id: impl Into<String>, description: impl Into<String>) {
        self.updates.push(PlotUpdate {
            session_id: session_id.into(),
            description: description.into(),
        });
    }

    pub fn latest_update(&self) -> Option<&PlotUpdate> {
        self.updates.last()
    }
}

/// The campaign state: setting, known NPCs, locations and plot threads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorldState {
    pub name: String,
    pub setting: String,
    pub overarching_goal: Option<String>,

    /// NPC name -> profile.
    pub npcs: BTreeMap<String, NpcProfile>,

    /// Location name -> location.
    pub locations: BTreeMap<String, Location>,

    /// Plot threads in creation order.
    pub plot_threads: Vec<PlotThread>,
}

impl WorldState {
    /// Create a new empty world state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a named campaign.
    pub fn campaign(name: impl Into<String>, setting: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            setting: setting.into(),
            ..Self::default()
        }
    }

    /// Whether any campaign information has been recorded.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
            && self.setting.is_empty()
            && self.npcs.is_empty()
            && self.locations.is_empty()
            && self.plot_threads.is_empty()
    }

    pub fn npc(&self, name: &str) -> Option<&NpcProfile> {
        self.npcs.get(name)
    }

    pub fn npc_mut(&mut self, name: &str) -> Option<&mut NpcProfile> {
        self.npcs.get_mut(name)
    }

    /// Add or replace an NPC profile.
    pub fn upsert_npc(&mut self, npc: NpcProfile) {
        self.npcs.insert(npc.name.clone(), npc);
    }

    pub fn location(&self, name: &str) -> Option<&Location> {
        self.locations.get(name)
    }

    pub fn location_mut(&mut self, name: &str) -> Option<&mut Location> {
        self.locations.get_mut(name)
    }

    /// Add or replace a location.
    pub fn upsert_location(&mut self, location: Location) {
        self.locations.insert(location.name.clone(), location);
    }

    /// Start a new plot thread and return its id.
    pub fn add_plot_thread(
        &mut self,
        title: impl Into<String>,
        description: impl Into<String>,
        related_npcs: Vec<String>,
        session_id: impl Into<String>,
    ) -> String {
        let id = format!("plot_{:03}", self.plot_threads.len() + 1);
        self.plot_threads.push(PlotThread {
            id: id.clone(),
            title: title.into(),
            description: description.into(),
            status: PlotStatus::Active,
            related_npcs,
            created_in_session: session_id.into(),
            updates: Vec::new(),
        });
        id
    }

    /// Find a plot thread by its title.
    pub fn plot_thread_by_title_mut(&mut self, title: &str) -> Option<&mut PlotThread> {
        self.plot_threads.iter_mut().find(|p| p.title == title)
    }

    pub fn plot_threads_with_status(&self, status: PlotStatus) -> Vec<&PlotThread> {
        self.plot_threads
            .iter()
            .filter(|p| p.status == status)
            .collect()
    }

    /// Format the campaign as a prompt section for the narrator.
    ///
    /// Returns an empty string when nothing has been recorded.
    pub fn briefing(&self) -> String {
        if self.is_empty() {
            return String::new();
        }

        let mut out = String::new();
        out.push_str(&format!("Campaign: {}\n", self.name));
        out.push_str(&format!("Setting: {}\n", self.setting));
        if let Some(goal) = &self.overarching_goal {
            out.push_str(&format!("Overarching Goal: {}\n", goal));
        }
        out.push('\n');

        let active = self.plot_threads_with_status(PlotStatus::Active);
        if !active.is_empty() {
            out.push_str("Active Plot Threads:\n");
            for plot in active {
                out.push_str(&format!("- {}: {}\n", plot.title, plot.description));
                if let Some(latest) = plot.latest_update() {
                    out.push_str(&format!("  Latest: {}\n", latest.description));
                }
            }
            out.push('\n');
        }

        if !self.npcs.is_empty() {
            out.push_str("Known NPCs:\n");
            for npc in self.npcs.values().take(BRIEFING_NPC_LIMIT) {
                out.push_str(&format!(
                    "- {} ({}): {}\n",
                    npc.name,
                    npc.role.as_deref().unwrap_or("NPC"),
                    npc.description
                ));
                if !npc.knowledge.is_empty() {
                    let known: Vec<_> = npc
                        .knowledge
                        .iter()
                        .take(BRIEFING_KNOWLEDGE_LIMIT)
                        .map(String::as_str)
                        .collect();
                    out.push_str(&format!("  Knows: {}\n", known.join(", ")));
                }
                if let Some(loc) = &npc.last_seen_location {
                    out.push_str(&format!("  Last seen: {}\n", loc));
                }
            }
            out.push('\n');
        }

        if !self.locations.is_empty() {
            out.push_str("Known Locations:\n");
            for loc in self.locations.values().take(BRIEFING_LOCATION_LIMIT) {
                let description: String = loc
                    .description
                    .chars()
                    .take(BRIEFING_DESCRIPTION_CHARS)
                    .collect();
                out.push_str(&format!("- {}: {}\n", loc.name, description));
                if let Some(event) = loc.notable_events.last() {
                    out.push_str(&format!("  Events: {}\n", event));
                }
            }
            out.push('\n');
        }

        out
    }
}
