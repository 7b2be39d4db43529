//! The streaming core: read the log incrementally, merge the subsequences,
//! and run each subscription as its own task.

pub mod multiplex;
pub mod poller;
pub mod session;

pub use multiplex::{Batch, Delivery, StreamRecord};
pub use poller::Poller;
pub use session::{CloseReason, Session, Subscription};
