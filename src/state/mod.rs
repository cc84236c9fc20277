//! State management module
//!
//! This module handles all application state, including:
//! - The SQLite record store (library.rs)
//! - Shared data structures (data.rs)
//! - Client-local key-value state (local.rs)
//! - The guest's registered display name (guest.rs)

pub mod library;
pub mod data;
pub mod local;
pub mod guest;
