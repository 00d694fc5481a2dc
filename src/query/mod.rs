//! Query and reference handles.
//!
//! A [`Query`] names a location plus ordering/filtering constraints and owns
//! the listener aggregates for that query. A [`DatabaseReference`] is a query
//! without constraints that can also be written to.
//!
//! Refinements validate their arguments against the constraints already in
//! place and fail synchronously with [`BridgeError::InvalidQuery`]:
//!
//! ```ignore
//! let top = database.reference("scores")?.order_by_child("points")?.limit_to_last(10)?;
//! assert!(database.reference("scores")?.order_by_key()?.start_at(5).is_err());
//! ```
//!
//! [`BridgeError::InvalidQuery`]: crate::error::BridgeError::InvalidQuery

mod handle;
mod params;

pub use handle::{DatabaseReference, OnDisconnect, Query};
pub use params::{Limit, OrderBy, QueryBound, QueryParams, QuerySpec, QueryValue};
