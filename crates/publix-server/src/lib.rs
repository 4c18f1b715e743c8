//! HTTP surface for the publix study-execution engine.
//!
//! Identity tokens travel in the `x-publix-id-token` header both ways; errors
//! come back as a JSON envelope carrying the request id.

pub mod api_errors;
pub mod api_handlers;
pub mod api_models;

pub use api_errors::{ApiError, ErrorBody};
pub use api_handlers::{build_router, PublixApiState, ID_TOKEN_HEADER};
pub use api_models::{ApiEnvelope, ApiMeta};
