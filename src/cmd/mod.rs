//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                         |
//! |-----------|-------------------------------------------|
//! | `run`     | `Run`                                      |
//! | `session` | `Status`, `List`, `Stop`, `RetryStage`     |

pub mod run;
pub mod session;

pub use run::cmd_run;
pub use session::{cmd_list, cmd_retry_stage, cmd_status, cmd_stop};
