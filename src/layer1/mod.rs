//! Layer1: absorption confirmation for active trap setups

pub mod engine;
pub mod metrics;

pub use engine::{run_layer1, AbsorptionEngine, Layer1Feeds};
