//! westore - model-driven REST API over document stores
//!
//! Models are declared as JSON documents and bound to datasources. The
//! registry turns them into operations with access control, an event
//! pipeline, relation expansion and an optional read-through cache
//! kept in the in-process `memorykv` store.

pub mod auth;
pub mod cli;
pub mod config;
pub mod datasource;
pub mod filter;
pub mod memorykv;
pub mod model;
pub mod rest_api;
pub mod value;
