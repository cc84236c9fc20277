//! Shared photo timeline for wedding guests.
//!
//! Guests sign in with the invitation link, register a display name and
//! upload photos; everyone sees one timeline, newest first, paged on demand
//! and updated live as new photos arrive.

pub mod auth;
pub mod config;
pub mod error;
pub mod gift;
pub mod state;
pub mod store;
pub mod timeline;
pub mod upload;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
