//! Per-connection state and the sharded connection table.

pub mod observer;
pub mod table;

pub use observer::Observer;
pub use table::ConnTable;
