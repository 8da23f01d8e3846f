//! Session State Manager: a durable, cross-process JSON state file with
//! PID-aware advisory locking (§4.1).

mod lock;
mod store;
mod types;

pub use lock::FileLock;
pub use store::StateStore;
pub use types::{
    Complexity, DriverPhase, FileChangeRecord, GateStatus, GateVerdict, SessionState,
    SessionStatePatch, SessionStatus, Stage, StagePlan, Task, TaskProgress, TaskStatus,
};
