//! # activity-relay
//!
//! Streams execution activity from a Postgres-backed log to live clients
//! over Server-Sent Events.
//!
//! The server side polls the log incrementally per subscription, merges
//! status transitions with output lines in one total order, and frames them
//! as named SSE events that carry a resumable cursor. The client side
//! ([`client::Connector`]) keeps a subscription alive across reconnects
//! without gaps or duplicates.

pub mod client;
pub mod config;
pub mod cursor;
pub mod db;
pub mod error;
pub mod model;
pub mod protocol;
pub mod store;
pub mod stream;
pub mod telemetry;
pub mod transport;
