//! Stream plumbing shared by every layer
//!
//! - Bounded drop-oldest channels between layers
//! - Exponential reconnect backoff and stop-aware sleeps

pub mod backoff;
pub mod backpressure;

pub use self::backoff::{sleep_or_stop, Backoff};
pub use self::backpressure::{channel, EventReceiver, EventSender};
