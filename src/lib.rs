//! Role-based CRM backend: segments, companies and contacts moving through
//! approval and assignment pipelines, served as a JSON API.

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod export;
pub mod ingest;
pub mod model;
pub mod pipeline;
pub mod validate;

pub use error::{AppError, Result};
