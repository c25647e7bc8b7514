pub mod error;
pub mod rest;
pub mod types;
pub mod websocket;

pub use error::{ApiError, ApiResult};
pub use rest::api_router;
