//! Layer3: execution planning, order placement and notification

pub mod executor;
pub mod planner;
pub mod sizing;

pub use executor::{run_layer3, Executor, Layer3Clients};
pub use planner::{build_execution_plan, derive_entry_price};
