//! External collaborators consumed by the baseline OCPP handlers.
//!
//! Both are traits so handlers can be exercised against mocks; the gateway
//! ships simple in-memory implementations.

pub mod authorization;
pub mod transactions;

pub use authorization::*;
pub use transactions::*;
