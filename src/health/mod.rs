//! AZ self-health arbitration.
//!
//! Decides whether this instance should report healthy to the load balancer,
//! coordinating through a shared ephemeral lock so at most one availability
//! zone removes itself from the pool at any time.

pub mod coordinator;
pub mod monitor;
pub mod probe;

pub use monitor::{Failure, StatusMonitor};
