//! DevLink3 socket connector (spec §4.4).

mod connection;
mod transport;

pub use connection::{ConnectionState, DevLink3Connection, DevLink3Params};
pub use transport::Transport;
