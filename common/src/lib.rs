//! CivicLedger Common Types
//!
//! Shared types used across the settlement core: identifiers, monetary
//! values, the error taxonomy, time helpers and the domain events emitted
//! to the notification dispatcher.

pub mod identifiers;
pub mod monetary;
pub mod error;
pub mod events;
pub mod time;

pub use identifiers::*;
pub use monetary::*;
pub use error::*;
pub use events::*;
pub use time::*;
