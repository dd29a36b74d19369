//! # gamequery
//!
//! Umbrella crate for the query workspace. It re-exports the two member
//! crates so integration tests and downstream users can depend on one name:
//!
//! - [`protocol`]: result model, wire reader, fragment reassembly and codecs
//! - [`engine`]: per-target state machines, the query engine and the UDP driver

pub use engine;
pub use protocol;
