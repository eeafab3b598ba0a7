pub mod config;
pub mod coverage;
pub mod embedded;
pub mod engine;
pub mod harness;
pub mod input;
pub mod protocol;
pub mod single_shot;
pub mod transform;

/// Process exit code for protocol and I/O violations (255 once truncated by
/// the OS).
pub const FATAL_EXIT_CODE: i32 = -1;

pub use config::ShuttleConfig;
pub use coverage::{CoverageRegistry, CoverageTracker, EpochReset, GLOBAL_COVERAGE};
pub use embedded::{EmbeddedEngine, Interpreter};
pub use engine::{CommandEngine, Engine, FnEngine, Outcome};
pub use harness::Harness;
pub use input::FixedBuffer;
pub use protocol::{Channels, PersistentLoop, ProtocolError};
pub use single_shot::{SingleShotError, SingleShotInput, run_once};
pub use transform::{Normalizer, TransformError};
