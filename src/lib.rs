//! btlink: point-to-point Bluetooth serial links
//!
//! A [`ConnectionManager`] keeps one RFCOMM (or simulated) byte-stream link to
//! a single peer. It listens for inbound connections while idle, dials on
//! request, recovers from failures by returning to listening, and reports
//! everything as an ordered stream of [`LinkEvent`]s.

pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod transport;

pub use config::Config;
pub use connection::{ConnectionManager, ConnectionState, LinkEvent};
pub use error::LinkError;
pub use transport::{PeerIdentity, RadioState, Transport};
