//! NPC profiles.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A persistent NPC the narrator has introduced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NpcProfile {
    pub name: String,
    pub description: String,
    /// e.g. "quest giver", "antagonist", "merchant".
    pub role: Option<String>,

    /// What this NPC knows, in the order it was learned.
    #[serde(default)]
    pub knowledge: Vec<String>,

    /// Other character name -> relationship description.
    #[serde(default)]
    pub relationships: BTreeMap<String, String>,

    pub last_seen_location: Option<String>,
    pub last_seen_session: Option<String>,
    pub first_appeared_session: Option<String>,

    #[serde(default)]
    pub notes: Vec<String>,
}

impl NpcProfile {
    /// Create a new profile with the given name and description.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            role: None,
            knowledge: Vec::new(),
            relationships: BTreeMap::new(),
            last_seen_location: None,
            last_seen_session: None,
            first_appeared_session: None,
            notes: Vec::new(),
        }
    }

    /// Record something the NPC knows. Duplicates are ignored.
    pub fn add_knowledge(&mut self, item: impl Into<String>) {
        let item = item.into();
        if !self.knowledge.contains(&item) {
            self.knowledge.push(item);
        }
    }

    /// Set or replace the relationship with another character.
    pub fn set_relationship(&mut self, target: impl Into<String>, relationship: impl Into<String>) {
        self.relationships.insert(target.into(), relationship.into());
    }

    /// Update where and when the NPC was last seen.
    pub fn seen_at(&mut self, location: impl Into<String>, session_id: impl Into<String>) {
        self.last_seen_location = Some(location.into());
        self.last_seen_session = Some(session_id.into());
    }
}
