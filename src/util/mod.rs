//! Small, independently testable helpers shared by the scheduler and driver
//! (§4.8): file-change merging, progress stats, prior-context compression,
//! stuck-loop detection, and objective classification.

pub mod classify;
pub mod context;
pub mod merge;
pub mod progress;
pub mod stuck;

pub use classify::is_actionable_objective;
pub use context::PriorContextBuilder;
pub use merge::merge_file_changes;
pub use progress::{compute_progress_stats, ProgressStats};
pub use stuck::StuckLoopDetector;
