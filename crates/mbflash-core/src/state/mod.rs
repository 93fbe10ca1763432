//! State machine module.

pub mod machine;
pub mod steps;

pub use machine::{SessionState, UpdatePhase};
pub use steps::{StepContext, commit_page, fill_page, reboot, reset_watchdog, verify_counter};
