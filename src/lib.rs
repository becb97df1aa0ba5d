pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod packet;
pub mod peer;
pub mod stats;
pub mod stream;

pub use connection::{Connection, ConnectionState};
pub use error::{QsError, QsResult};
