pub mod connection;
pub mod tls;

pub use connection::{BufferedConnection, ConnError, ConnTag, RecvOutcome};
