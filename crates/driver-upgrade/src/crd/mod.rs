//! Custom resources this crate reads and writes but does not own.

pub mod node_maintenance;
