//! Built-in rule engines.
//!
//! The production 66 / Thousand engines live outside this crate and plug in
//! through [`EngineRegistry`](crate::engine::EngineRegistry); the compact
//! engine here drives the runtime in tests and lets the bundled worker
//! daemon run bot-vs-bot tables.

pub mod trick;

use crate::engine::EngineRegistry;

/// Registry with the bundled engine behind both game types.
pub fn default_registry() -> EngineRegistry {
    let mut registry = EngineRegistry::new();
    registry.register(Box::new(trick::TrickEngineFactory::sixty_six()));
    registry.register(Box::new(trick::TrickEngineFactory::thousand()));
    registry
}
