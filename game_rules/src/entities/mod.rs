//! Entity definitions tracked across a campaign: NPC profiles and locations.

mod location;
mod npc;

pub use location::*;
pub use npc::*;
