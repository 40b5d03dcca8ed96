//! Connection management for a single point-to-point serial link
//!
//! This module handles:
//! - The link state machine (idle, listening, connecting, connected)
//! - Listen, connect and transfer workers, one live at a time
//! - Automatic return to listening after connect failures and link loss
//! - Ordered delivery of lifecycle and data events to one consumer

mod connect;
mod event;
mod link;
mod listen;
mod manager;
mod state;
mod transfer;
mod worker;

pub use connect::ConnectWorker;
pub use event::LinkEvent;
pub use link::Link;
pub use listen::ListenWorker;
pub use manager::ConnectionManager;
pub use state::{next_state, ConnectionState, Trigger};
pub use transfer::TransferWorker;
pub use worker::{Report, Worker, WorkerContext, WorkerHandle, WorkerId, WorkerKind};
