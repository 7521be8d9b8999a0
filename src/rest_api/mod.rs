//! # REST API Module
//!
//! HTTP endpoints for every public model: list, count, fetch by id,
//! create, partial update and delete. Bearer tokens decode into the
//! request principal; access control runs inside the model operations.

pub mod errors;
pub mod parser;
pub mod response;
pub mod server;

pub use errors::{RestError, RestResult};
pub use parser::QueryParams;
pub use server::RestServer;
