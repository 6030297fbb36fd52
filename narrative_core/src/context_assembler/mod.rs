//! Context Assembler - Builds a bounded context for one narrator turn.
//!
//! The assembly policy works as follows:
//! 1. **Selection**: The active scene plus the `k` most recently closed scenes keep full detail
//! 2. **Summarization**: Every older scene collapses to one summary item
//! 3. **Ordering**: Items follow scene creation order, so the most recent detail comes last
//! 4. **Budgeting**: While over budget, drop the oldest unprotected event, then the oldest summary
//!
//! Events of the active scene are never dropped. Output is recomputed from the
//! current session on every call and contains no hidden state.

mod meter;

pub use meter::*;

use serde::Serialize;
use std::sync::Arc;

use crate::session_log::{Event, SceneId, Session};

/// Placeholder used for summarized scenes that never received a summary.
pub const MISSING_SUMMARY: &str = "scene occurred, no summary available";

/// Configuration for context assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextConfig {
    /// How many closed scenes, counted back from the newest, keep every event.
    pub recent_scenes: usize,

    /// Maximum assembled size, in the meter's unit.
    pub budget: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            recent_scenes: 2,
            budget: 8000,
        }
    }
}

/// One entry of an assembled context.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContextItem {
    /// A literal event from a full-detail scene.
    Event { scene_id: SceneId, event: Event },

    /// A stand-in for an older scene.
    SceneSummary {
        scene_id: SceneId,
        title: String,
        location: String,
        summary: Option<String>,
    },
}

impl ContextItem {
    pub fn scene_id(&self) -> SceneId {
        match self {
            ContextItem::Event { scene_id, .. } | ContextItem::SceneSummary { scene_id, .. } => {
                *scene_id
            }
        }
    }

    /// The text this item contributes to the prompt.
    pub fn render(&self) -> String {
        match self {
            ContextItem::Event { event, .. } => {
                format!("[{}] {}: {}", event.event_type, event.actor, event.content)
            }
            ContextItem::SceneSummary {
                title,
                location,
                summary,
                ..
            } => format!(
                "[scene summary] {} ({}): {}",
                title,
                location,
                summary.as_deref().unwrap_or(MISSING_SUMMARY)
            ),
        }
    }
}

/// The assembled context ready for prompt generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssembledContext {
    pub items: Vec<ContextItem>,

    /// Total size of `items`, in the meter's unit.
    pub size: usize,

    /// Size of the active scene's events, which the budget never trims.
    pub protected_size: usize,

    /// Number of items dropped to meet the budget.
    pub dropped: usize,
}

impl AssembledContext {
    /// Format the context as a prompt block.
    pub fn to_prompt_string(&self, session: &Session) -> String {
        render(&self.items, session)
    }
}

/// Format context items as a prompt block, with a heading at each scene change.
pub fn render(items: &[ContextItem], session: &Session) -> String {
    let mut prompt = String::new();
    let mut current: Option<SceneId> = None;

    for item in items {
        if let ContextItem::Event { scene_id, .. } = item {
            if current != Some(*scene_id) {
                let heading = match session.scene(*scene_id) {
                    Some(scene) if scene.active => {
                        format!("## Current scene: {} ({})\n", scene.title, scene.location)
                    }
                    Some(scene) => format!("## Scene: {} ({})\n", scene.title, scene.location),
                    None => format!("## {}\n", scene_id),
                };
                prompt.push_str(&heading);
            }
            current = Some(*scene_id);
        } else {
            current = None;
        }
        prompt.push_str(&item.render());
        prompt.push('\n');
    }

    prompt
}

/// The context assembler builds prompt context from the session log.
pub struct ContextAssembler {
    config: ContextConfig,
    meter: Arc<dyn SizeMeter>,
}

impl ContextAssembler {
    /// Create a new context assembler with the given configuration and meter.
    pub fn new(config: ContextConfig, meter: Arc<dyn SizeMeter>) -> Self {
        Self { config, meter }
    }

    /// Create a context assembler with default configuration, counting characters.
    pub fn with_defaults() -> Self {
        Self::new(ContextConfig::default(), Arc::new(CharMeter))
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Assemble the context for the session's current state.
    pub fn assemble(&self, session: &Session) -> AssembledContext {
        // Step 1: Decide which closed scenes keep full detail
        let closed: Vec<SceneId> = session
            .scenes
            .iter()
            .filter(|s| !s.active)
            .map(|s| s.id)
            .collect();
        let detail_from = closed.len().saturating_sub(self.config.recent_scenes);
        let detailed_closed = &closed[detail_from..];

        // Step 2: Build items in scene order
        let mut entries: Vec<Entry> = Vec::new();
        for scene in &session.scenes {
            if scene.active || detailed_closed.contains(&scene.id) {
                for event in &scene.events {
                    entries.push(self.entry(
                        ContextItem::Event {
                            scene_id: scene.id,
                            event: event.clone(),
                        },
                        scene.active,
                    ));
                }
            } else {
                entries.push(self.entry(
                    ContextItem::SceneSummary {
                        scene_id: scene.id,
                        title: scene.title.clone(),
                        location: scene.location.clone(),
                        summary: scene.summary.clone(),
                    },
                    false,
                ));
            }
        }

        // Step 3: Trim to budget
        let mut size: usize = entries.iter().map(|e| e.size).sum();
        let mut dropped = 0;
        while size > self.config.budget {
            let victim = entries
                .iter()
                .position(|e| !e.protected && e.is_event())
                .or_else(|| entries.iter().position(|e| !e.protected));
            let Some(idx) = victim else {
                break;
            };
            size -= entries.remove(idx).size;
            dropped += 1;
        }

        let protected_size = entries
            .iter()
            .filter(|e| e.protected)
            .map(|e| e.size)
            .sum();

        AssembledContext {
            items: entries.into_iter().map(|e| e.item).collect(),
            size,
            protected_size,
            dropped,
        }
    }

    fn entry(&self, item: ContextItem, protected: bool) -> Entry {
        Entry {
            size: self.meter.measure(&item.render()),
            item,
            protected,
        }
    }
}

struct Entry {
    item: ContextItem,
    size: usize,
    protected: bool,
}

impl Entry {
    fn is_event(&self) -> bool {
        matches!(self.item, ContextItem::Event { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_log::{EventType, MemoryStore, Metadata, SessionLog};

    /// Build a log with `closed` closed scenes (two events each) and one active
    /// scene with `active_events` events.
    fn setup_log(closed: usize, active_events: usize) -> SessionLog {
        let mut log = SessionLog::create(Arc::new(MemoryStore::new())).unwrap();
        for i in 0..closed {
            log.start_scene(format!("Scene {i}"), "Road", Vec::new())
                .unwrap();
            log.log_event(EventType::PlayerAction, "Ralph", format!("act {i}"), Metadata::new())
                .unwrap();
            log.log_event(EventType::Narration, "DM", format!("narrate {i}"), Metadata::new())
                .unwrap();
            let summary = (i % 2 == 0).then(|| format!("summary {i}"));
            log.end_scene(summary).unwrap();
        }
        log.start_scene("Now", "Here", Vec::new()).unwrap();
        for i in 0..active_events {
            log.log_event(EventType::PlayerAction, "Ralph", format!("now {i}"), Metadata::new())
                .unwrap();
        }
        log
    }

    fn kinds(ctx: &AssembledContext) -> Vec<String> {
        ctx.items
            .iter()
            .map(|item| match item {
                ContextItem::Event { event, .. } => event.content.clone(),
                ContextItem::SceneSummary { summary, .. } => {
                    format!("S:{}", summary.as_deref().unwrap_or("-"))
                }
            })
            .collect()
    }

    #[test]
    fn test_recent_scenes_full_detail_older_summarized() {
        let log = setup_log(4, 1);
        let assembler = ContextAssembler::new(
            ContextConfig {
                recent_scenes: 2,
                budget: usize::MAX,
            },
            Arc::new(CharMeter),
        );
        let ctx = assembler.assemble(log.session());

        assert_eq!(
            kinds(&ctx),
            vec![
                "S:summary 0",
                "S:-",
                "act 2",
                "narrate 2",
                "act 3",
                "narrate 3",
                "now 0"
            ]
        );
        assert_eq!(ctx.dropped, 0);
    }

    #[test]
    fn test_missing_summary_placeholder() {
        let log = setup_log(2, 0);
        let assembler = ContextAssembler::new(
            ContextConfig {
                recent_scenes: 0,
                budget: usize::MAX,
            },
            Arc::new(CharMeter),
        );
        let ctx = assembler.assemble(log.session());
        assert_eq!(ctx.items.len(), 2);
        assert!(ctx.items[1].render().contains(MISSING_SUMMARY));
    }

    #[test]
    fn test_assembly_is_deterministic() {
        let log = setup_log(5, 3);
        let assembler = ContextAssembler::new(
            ContextConfig {
                recent_scenes: 2,
                budget: 120,
            },
            Arc::new(CharMeter),
        );
        let first = assembler.assemble(log.session());
        let second = assembler.assemble(log.session());
        assert_eq!(first, second);
    }

    #[test]
    fn test_budget_drops_oldest_detail_first() {
        let log = setup_log(3, 1);
        let full = ContextAssembler::new(
            ContextConfig {
                recent_scenes: 2,
                budget: usize::MAX,
            },
            Arc::new(CharMeter),
        )
        .assemble(log.session());

        // Room for everything except one event.
        let first_event_size = full.items[1].render().chars().count();
        let assembler = ContextAssembler::new(
            ContextConfig {
                recent_scenes: 2,
                budget: full.size - first_event_size,
            },
            Arc::new(CharMeter),
        );
        let ctx = assembler.assemble(log.session());

        assert_eq!(ctx.dropped, 1);
        assert!(ctx.size <= assembler.config().budget);
        assert_eq!(
            kinds(&ctx),
            vec!["S:summary 0", "narrate 1", "act 2", "narrate 2", "now 0"]
        );
    }

    #[test]
    fn test_budget_never_drops_active_scene_events() {
        let log = setup_log(3, 4);
        let assembler = ContextAssembler::new(
            ContextConfig {
                recent_scenes: 2,
                budget: 1,
            },
            Arc::new(CharMeter),
        );
        let ctx = assembler.assemble(log.session());

        assert_eq!(kinds(&ctx), vec!["now 0", "now 1", "now 2", "now 3"]);
        assert_eq!(ctx.size, ctx.protected_size);
    }

    #[test]
    fn test_size_within_budget_except_protected() {
        let log = setup_log(6, 2);
        for budget in [0, 10, 50, 100, 200, 400, 1000] {
            let assembler = ContextAssembler::new(
                ContextConfig {
                    recent_scenes: 3,
                    budget,
                },
                Arc::new(TokenMeter::default()),
            );
            let ctx = assembler.assemble(log.session());
            assert!(ctx.size <= budget.max(ctx.protected_size));
        }
    }

    #[test]
    fn test_prompt_string_has_scene_headings() {
        let log = setup_log(1, 1);
        let ctx = ContextAssembler::with_defaults().assemble(log.session());
        let prompt = ctx.to_prompt_string(log.session());

        assert!(prompt.contains("## Scene: Scene 0 (Road)"));
        assert!(prompt.contains("## Current scene: Now (Here)"));
        assert!(prompt.contains("[player_action] Ralph: now 0"));
    }

    #[test]
    fn test_no_active_scene() {
        let mut log = setup_log(1, 0);
        log.end_scene(None).unwrap();
        let ctx = ContextAssembler::with_defaults().assemble(log.session());
        assert_eq!(ctx.protected_size, 0);
        assert_eq!(ctx.items.len(), 2);
    }
}
