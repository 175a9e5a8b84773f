//! `rove-middleware` – the link layer between host and robot
//!
//! Turns a raw notify/write channel into request/response calls and typed
//! event streams.
//!
//! # Modules
//!
//! - [`transport`] – the [`Transport`] seam every link implements.
//! - [`router`] – [`EventRouter`]: one-shot and persistent subscribers keyed
//!   by [`EventKind`][rove_types::EventKind], plus the diagnostics channel.
//! - [`tracker`] – sequence-id allocation, in-flight requests, lost-event
//!   detection.
//! - [`connection`] – [`Connection`]: the writer task with busy postponement
//!   and the notification pump.
//! - [`commands`] – [`RobotClient`], one typed method per robot command.
//! - [`sim`] – [`SimRobot`], an in-process robot model.
//! - [`tcp`] – [`TcpTransport`], frames over a TCP stream.

pub mod commands;
pub mod connection;
pub mod router;
pub mod sim;
pub mod tcp;
pub mod tracker;
pub mod transport;

pub use commands::{LedAnimation, RobotClient};
pub use connection::{Connection, LINK_TARGET, LinkConfig};
pub use router::{EventRouter, ResponseWaiter, Subscription};
pub use sim::SimRobot;
pub use tcp::TcpTransport;
pub use tracker::{EventIdCounter, RequestState, RequestTracker};
pub use transport::Transport;
