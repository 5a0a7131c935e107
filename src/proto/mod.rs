//! The wire protocol: typed frames, multiplexing, keepalive,
//! authentication, and the master/slave session layers built on them.

pub mod auth;
pub mod keepalive;
pub mod link;
pub mod master;
pub mod mux;
pub mod slave;

pub use link::{Frame, FramedLink, LogEntry, ObjectLink, Payload, SlaveInfo};
pub use master::{MasterJob, MasterSession};
pub use mux::{Multiplexer, SubLink};
pub use slave::{SlaveJob, SlaveSession};
