pub mod connection;
pub mod dns;
pub mod error;
pub mod network;
pub mod schema;

pub use connection::ConnectionManager;
pub use dns::ZoneStore;
pub use network::{NetworkStatus, NetworkStore};
pub use schema::SchemaManager;
