//! Campaign locations.

use serde::{Deserialize, Serialize};

/// A significant place in the campaign world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub description: String,

    /// Key events that happened here, oldest first.
    #[serde(default)]
    pub notable_events: Vec<String>,

    /// Names of NPCs currently here.
    #[serde(default)]
    pub npcs_present: Vec<String>,

    pub first_visited_session: Option<String>,
    pub last_visited_session: Option<String>,
}

impl Location {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            notable_events: Vec::new(),
            npcs_present: Vec::new(),
            first_visited_session: None,
            last_visited_session: None,
        }
    }

    pub fn add_event(&mut self, event: impl Into<String>) {
        self.notable_events.push(event.into());
    }

    /// Add an NPC to this location. Returns `false` if already present.
    pub fn add_npc(&mut self, npc: impl Into<String>) -> bool {
        let npc = npc.into();
        if self.npcs_present.contains(&npc) {
            return false;
        }
        self.npcs_present.push(npc);
        true
    }

    /// Remove an NPC from this location. Returns `false` if not found.
    pub fn remove_npc(&mut self, npc: &str) -> bool {
        let before = self.npcs_present.len();
        self.npcs_present.retain(|n| n != npc);
        self.npcs_present.len() != before
    }

    /// Mark the location as visited in the given session.
    pub fn visit(&mut self, session_id: impl Into<String>) {
        let session_id = session_id.into();
        if self.first_visited_session.is_none() {
            self.first_visited_session = Some(session_id.clone());
        }
        self.last_visited_session = Some(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_npc_presence() {
        let mut loc = Location::new("The Shrouded Flagon", "A smoky tavern");
        assert!(loc.add_npc("Mira"));
        assert!(!loc.add_npc("Mira"));
        assert!(loc.remove_npc("Mira"));
        assert!(!loc.remove_npc("Mira"));
    }

    #[test]
    fn test_visit_tracks_first_and_last() {
        let mut loc = Location::new("Crossroads", "Where four roads meet");
        loc.visit("s1");
        loc.visit("s2");
        assert_eq!(loc.first_visited_session.as_deref(), Some("s1"));
        assert_eq!(loc.last_visited_session.as_deref(), Some("s2"));
    }
}
