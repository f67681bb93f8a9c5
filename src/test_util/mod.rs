//! Deterministic test doubles for the messaging stack: an in-memory datagram fabric
//!  with scriptable loss, and a recording application consumer. Exported as regular
//!  code so downstream crates can reuse them in their own tests.

pub mod app;
pub mod network;
