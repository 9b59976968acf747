//! Client-side services: each owns one slice of session state and exposes
//! snapshots plus watch streams over it.

pub mod chat;
pub mod messaging;
pub mod server_events;
pub mod site_settings;
pub mod socket;
pub mod tarot_chat;
pub mod tarot_game;
pub mod token;
