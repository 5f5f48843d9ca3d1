//! Workflow orchestration and gate automation.
//!
//! Leaves first:
//! - [`risk`]: classifies a step's potential impact
//! - [`history`] and [`learning`]: approval log and per-gate confidence
//! - [`gate`]: gate policy per mode and the pending-approval controller
//! - [`coordinator`]: task graph, exclusive claims with leases, conflicts
//! - [`escalation`]: trigger table, SLAs and the audit log
//! - [`orchestrator`]: drives runs through their steps

pub mod content;
pub mod coordinator;
pub mod escalation;
pub mod gate;
pub mod history;
pub mod learning;
pub mod manifest;
pub mod orchestrator;
pub mod risk;
pub mod run_state;
