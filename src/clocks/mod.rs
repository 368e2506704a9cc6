//! Identity and causality primitives: replica identifiers, vector clocks and
//! hybrid timestamps. Everything above this module orders operations through
//! these three types.

pub mod client_id;
pub mod hybrid;
pub mod vector_clock;
