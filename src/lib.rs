//! A programmable SMTP server.
//!
//! Sessions dispatch every command through dependency-sorted handler chains
//! taken from a [`Registry`](smtp::registry::Registry). Mail addressed to
//! foreign domains is handed to the [`Relay`](relay::Relay), a durable
//! on-disk queue that delivers through the outbound [`client`].

pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod headers;
pub mod listener;
pub mod logging;
pub mod queue;
pub mod relay;
pub mod server;
pub mod smtp;
pub mod status;

pub use tracing;

pub use config::Config;
pub use controller::{Controller, SHUTDOWN_BROADCAST, Signal};
pub use server::Server;
