//! Session state kept by the client.
//!
//! Token acquisition and refresh live in the auth backend. This module only
//! remembers who is signed in and tells the cache when that changes.

pub mod session;

pub use session::{Session, SessionData, SESSION_KEY};
