pub mod semantic;
pub mod stuck;

pub use semantic::SemanticGuard;
pub use stuck::{StuckConfig, StuckDetector, StuckResult};
