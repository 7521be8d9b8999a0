//! # In-Memory KV Store
//!
//! A `Database` of named `Bucket`s mapping string keys to sequences of
//! byte blobs. Every bucket owns an expiration queue and a reaper task
//! that removes rows once their TTL elapses.

pub mod bucket;
pub mod database;
pub mod errors;
pub mod expiration;

pub use bucket::{Blobs, Bucket, BucketStats, DEFAULT_EXPIRATION};
pub use database::Database;
pub use errors::{KvError, KvResult};
pub use expiration::{Expiration, ExpirationQueue};
