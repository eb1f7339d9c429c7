//! GT06 tracker ingest.
//!
//! - [`gt06_core`]: framing, decoding and acknowledgments, no I/O.
//! - [`gateway`]: TCP listener, sessions, abuse guard, storage and query API.

pub use gateway;
pub use gt06_core;
