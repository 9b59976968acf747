//! Client runtime for the site's real-time chat subsystem.
//!
//! The crate is organized as a set of services wired together at startup:
//! the [`services::token::TokenService`] validates and publishes the auth
//! token, the [`services::socket::SocketService`] keeps exactly one socket
//! connection alive per token, and the chat, tarot, and settings services
//! build their state on top of the socket's event streams and the REST
//! [`api::ChatApi`]. Everything tears down through a shared
//! [`scope::Scope`].

pub mod api;
pub mod audio;
pub mod error;
pub mod readonly;
pub mod scope;
pub mod services;
