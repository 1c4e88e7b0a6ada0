//! Layer0: trap setup detection
//!
//! Fuses liquidation clusters, funding/OI positioning and cross-exchange OI
//! divergence into a directional setup score.

pub mod detector;
pub mod liquidation_book;
pub mod signals;

pub use detector::{run_layer0, TrapDetector};
pub use liquidation_book::{LiquidationBook, LiquidationProximity, SweptZones};
