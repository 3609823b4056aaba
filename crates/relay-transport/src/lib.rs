pub mod dispatcher;
pub mod http;
pub mod reliability;
pub mod server;
pub mod ws;

pub use dispatcher::Envelope;
pub use http::{bind_listener, HttpFrontDoor};
pub use reliability::{DeadlinePolicy, FixedDeadline, RelayStats, StatsSnapshot};
pub use server::{PublishOutcome, Relay, RelayHandle, RelayServer};
pub use ws::{Connection, ConnectionHub};
