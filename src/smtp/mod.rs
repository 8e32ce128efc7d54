//! The inbound SMTP protocol: sessions, handler chains and their built-in
//! handlers.

pub mod command;
pub mod connection;
pub mod context;
pub mod handler;
pub mod plugins;
pub mod registry;
pub mod session;

pub use handler::{Handler, HandlerDef, Reply, Request, Response, Verdict, handler_fn};
pub use session::{Outcome, Session, SessionConfig};
