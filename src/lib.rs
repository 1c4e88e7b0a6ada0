//! Phantom Pipeline Library
//!
//! Four-stage crypto derivatives signal pipeline: a trap setup detector
//! feeds an absorption stage, which feeds an ignition stage, which feeds
//! the executor. Stages talk over bounded drop-oldest queues.

pub mod cli;
pub mod config;
pub mod error;
pub mod exchange;
pub mod health;
pub mod layer0;
pub mod layer1;
pub mod layer2;
pub mod layer3;
pub mod notify;
pub mod pipeline;
pub mod stream;
pub mod types;

// Re-export commonly used types
pub use self::config::Config;
pub use self::error::{Error, Result};
