//! Layer2: ignition confirmation over candles and market structure

pub mod engine;
pub mod signals;
pub mod structure;

pub use engine::{run_layer2, IgnitionEngine, Layer2Feeds};
pub use structure::{HeuristicDetector, StructureDetector};
