//! HTTP API handlers for payproof-validator
//!
//! REST endpoints for submitting and reading validations, plus an SSE stream
//! of verdict events for downstream consumers.

pub mod health;
pub mod sse;
pub mod validation;

pub use health::health_routes;
pub use sse::verdict_event_stream;
pub use validation::validation_routes;
