//! # http-relay
//!
//! Reactive middleware dispatch for a request server. Inbound requests become
//! tagged tasks on a broadcast channel; registered stages pick them up by
//! predicate, and either act on them or republish a mutated copy for the next
//! stage. A single terminal stage answers each request exactly once.
//!
//! ```no_run
//! use http_relay::{PipelineBuilder, Predicate, RelayServer, Stage, Terminal};
//!
//! # async fn run() -> Result<(), http_relay::RelayError> {
//! let relay = RelayServer::from_builder(
//!     PipelineBuilder::new()
//!         .stage(Stage::map("greet", Predicate::tag(""), |t| {
//!             t.append("hello");
//!             t.set_tag("done");
//!             Ok(())
//!         }))
//!         .terminal(Terminal::echo("reply", Predicate::tag("done"))),
//! )?
//! .start()?;
//! relay.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub use relay_core::*;
pub use relay_transport::{
    bind_listener, Connection, ConnectionHub, DeadlinePolicy, Envelope, FixedDeadline,
    HttpFrontDoor, PublishOutcome, Relay, RelayHandle, RelayServer, RelayStats, StatsSnapshot,
};
