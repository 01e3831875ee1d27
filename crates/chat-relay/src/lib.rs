//! Chat relay - streaming backend for a ChatGPT web client
//!
//! This crate relays chat turns from a browser to either the official
//! chat-completions API or a session-token reverse proxy, streaming partial
//! replies back as newline-delimited JSON.

pub mod balance;
pub mod config;
pub mod crypto;
pub mod error;
pub mod persona;
pub mod provider;
pub mod relay;
pub mod server;
pub mod testing;
pub mod upstream;
pub mod watchdog;

pub use error::RelayError;
