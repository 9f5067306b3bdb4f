//! HTTP API module.
//!
//! JSON endpoints for creating, listing, viewing and deleting instances.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use handlers::{
    CreateInstanceResponse, DEFAULT_USER_ID, DeleteInstanceResponse, HealthResponse,
};
pub use routes::create_router;
pub use state::AppState;
