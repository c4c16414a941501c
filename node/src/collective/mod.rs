//! Collective communication between the ranks of a session
//!
//! [`Transport`] is the point-to-point seam (in-process channels for tests,
//! TCP for real nodes); [`Collective`] builds all-reduce, all-gather,
//! gather, broadcast and barrier on top of it.

pub mod ops;
pub mod transport;

pub use ops::Collective;
pub use transport::{
    CollectiveOp, CollectiveTag, Frame, MemoryTransport, RendezvousConfig, TcpTransport, Transport,
};
