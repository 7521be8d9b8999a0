//! # Filter Module
//!
//! The declarative read filter (`where`, `include`, `order`, `skip`,
//! `limit`) and its compilation into aggregation pipelines.

mod compiler;
pub mod dates;
mod errors;
mod predicate;
mod types;

pub use compiler::{Compiler, Schema};
pub use errors::{FilterError, FilterResult};
pub use predicate::canonical_field;
pub use types::{Direction, Filter, Include, OrderBy};
