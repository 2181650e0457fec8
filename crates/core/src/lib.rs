//! Order domain primitives.
//!
//! This crate contains the **pure domain** types that flow through the pipeline
//! (no transport or threading concerns).

pub mod error;
pub mod id;
pub mod order;
pub mod price;

pub use error::{DomainError, DomainResult};
pub use id::OrderId;
pub use order::Order;
pub use price::Price;
