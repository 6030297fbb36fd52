//! # Narrative Core (The Cortex)
//!
//! The narrator side of the game loop. This crate records what happened at the
//! table, decides what the narrator model gets to see, and runs the
//! tool-assisted turn that turns player input into narration. Game data and
//! dice live in `game_rules`.
//!
//! ## Core Components
//!
//! - **session_log**: Session → Scene → Event hierarchy, durably persisted on every change
//! - **context_assembler**: Chooses which history fits the narrator's context budget
//! - **tools**: Named, schema-checked operations the narrator can invoke
//! - **narrator**: Model client trait and an OpenAI-compatible implementation
//! - **interaction**: The per-turn state machine tying the above together
//!
//! ## Design Philosophy
//!
//! - **Durable First**: A change is visible only after it has been written
//! - **Fail Soft**: Tool failures go back to the narrator instead of ending the turn
//! - **Bounded**: Every turn has a ceiling on tool rounds, time, and context size

pub mod config;
pub mod context_assembler;
pub mod error;
pub mod interaction;
pub mod narrator;
pub mod session_log;
pub mod tools;

pub use config::*;
pub use context_assembler::*;
pub use error::*;
pub use interaction::*;
pub use narrator::*;
pub use session_log::*;
pub use tools::*;
