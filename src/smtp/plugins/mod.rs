//! Built-in handlers.
//!
//! Each command gets a `core` handler implementing its standard behaviour.
//! `rcpt/relay` and `queue/relay` add the anti-relay checks and the hand off
//! to the relay queue. Any of them can be disabled through the plugin
//! configuration and extended with further handlers.

pub mod auth;
pub mod connect;
pub mod data;
pub mod ehlo;
pub mod helo;
pub mod mail;
pub mod noop;
pub mod queue;
pub mod quit;
pub mod rcpt;
pub mod rset;
pub mod starttls;
pub mod timeout;
pub mod unrecognized;

use super::handler::HandlerDef;

pub(crate) fn builtin() -> Vec<(&'static str, HandlerDef)> {
    vec![
        ("connect", HandlerDef::new("core", connect::Core)),
        ("helo", HandlerDef::new("core", helo::Core)),
        ("ehlo", HandlerDef::new("core", ehlo::Core)),
        ("auth", HandlerDef::new("core", auth::Core)),
        ("mail", HandlerDef::new("core", mail::Core)),
        ("rcpt", HandlerDef::new("core", rcpt::Core)),
        (
            "rcpt",
            HandlerDef::new("relay", rcpt::Relay).after(["dnsbl"]),
        ),
        ("data", HandlerDef::new("core", data::Core)),
        ("queue", HandlerDef::new("core", queue::Core)),
        (
            "queue",
            HandlerDef::new("relay", queue::Relay).after(["core"]),
        ),
        ("rset", HandlerDef::new("core", rset::Core)),
        ("noop", HandlerDef::new("core", noop::Core)),
        ("quit", HandlerDef::new("core", quit::Core)),
        ("starttls", HandlerDef::new("core", starttls::Core)),
        ("timeout", HandlerDef::new("core", timeout::Core)),
        ("unrecognized", HandlerDef::new("core", unrecognized::Core)),
    ]
}

/// Domain part of an address, if it has one.
pub(crate) fn domain_of(address: &str) -> Option<&str> {
    address.rsplit_once('@').map(|(_, domain)| domain)
}
