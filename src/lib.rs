// src/lib.rs

// Import the top-level `lars` module.
pub mod lars;

// Re-exporting key items for easier external access.
pub use lars::cascade::Cascade;
pub use lars::driver::{CascadeEngine, CascadeEngineBuilder, RunOptions, RunReport, RunStatus};
pub use lars::echo::Echo;
pub use lars::store::{JsonlLogStore, LogStore, MemoryLogStore};
pub use lars::trait_registry::{TraitHandler, TraitRegistry};
pub use lars::transport::{ChatMessage, ChatTransport, Role};
