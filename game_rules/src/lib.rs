//! # Game Rules
//!
//! The "World Bible" crate - dice mechanics and the campaign world state.
//! This crate is the single source of truth for game data and does not contain any AI logic.

pub mod entities;
pub mod mechanics;
pub mod world_state;

pub use entities::*;
pub use mechanics::*;
pub use world_state::*;
