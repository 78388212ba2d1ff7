//! Coordination of cross-chain proposal finalization
//!
//! The coordination layer:
//! 1. Receives triggers from the event watchers and the periodic sweeps
//! 2. Serializes work per proposal in the driver
//! 3. Runs the finalization state machine against live on-chain flags
//! 4. Records settled proposals in the idempotency cache

pub mod driver;
pub mod scheduler;
pub mod workflow;

pub use driver::{Trigger, TriggerOutcome, TriggerSource, WorkflowDriver};
pub use scheduler::{ReconciliationScheduler, SweepReport};
pub use workflow::{FinalizationWorkflow, StepResult, WorkflowState};
