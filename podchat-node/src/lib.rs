//! podchat node: TCP transport, heartbeat, host election and the chat coordinator.
//! The protocol itself lives in `podchat_core`; this crate drives it over tokio.

pub mod config;
pub mod connection;
pub mod connector;
pub mod coordinator;
pub mod error;
pub mod heartbeat;
pub mod listener;

pub use config::Config;
pub use connection::{Connection, ConnectionHandler};
pub use connector::{find_host, Connector};
pub use coordinator::{Coordinator, CoordinatorOptions, CoordinatorState, IncomingMessage};
pub use error::{NodeError, NodeResult};
pub use heartbeat::HeartbeatMonitor;
pub use listener::Listener;
