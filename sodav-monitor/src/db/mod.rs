//! Persistence layer
//!
//! One module per entity: the row struct plus the queries that operate
//! on it. Functions that must participate in a caller's
//! transaction take `&mut SqliteConnection`; convenience wrappers over
//! the pool exist where callers never need transactional scope.

pub mod artists;
pub mod detections;
pub mod fingerprints;
pub mod schema;
pub mod stations;
pub mod stats;
pub mod tracks;

pub use schema::init_schema;
