pub mod config;
pub mod cursor;
pub mod engine;
pub mod messages;
pub mod reactions;
pub mod state;

pub use config::RelayConfig;
pub use cursor::CursorDedupTracker;
pub use engine::{EngineError, MessageSession, PollReport, ReactionSession, Relay, ScanPass};
pub use messages::{EventAssembler, FieldValue};
pub use reactions::{ReactionCache, ReactionDelta, ReactionDeltaTracker, ScanWindow};
pub use state::{CursorFile, StateError};
