//! Shared models and wire protocol for the Parlor chat client.
//!
//! This crate holds everything the client services and the server agree on:
//! the JSON socket frame format, the chat/tarot domain models, and small
//! cross-cutting utilities (time, logging).

pub mod logger;
pub mod models;
pub mod protocol;
pub mod time;
