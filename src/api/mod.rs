//! HTTP surface of the analysis service.
//!
//! `POST /analyze` runs the pipeline on one uploaded film; `GET /health` is a
//! liveness probe. The router is composable: `api_router()` returns a
//! `Router` that can be mounted on any axum server instance.

pub mod endpoints;
pub mod error;
pub mod router;
pub mod server;
pub mod types;

pub use router::api_router;
pub use server::{start_api_server_on, ApiServer, ApiSession, ServerError};
pub use types::ApiContext;
