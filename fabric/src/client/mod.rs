//! Client half of the fabric: the connection manager and the transports it drives.

pub mod connection;
pub mod local;
pub mod transport;
pub mod ws;

pub use connection::{ClientEvent, ClientOptions, ConnectionManager, ConnectionState};
pub use local::LocalConnector;
pub use ws::WsConnector;
