//! Services between the SQLite store and the transport layers: credential
//! issuance and rotation, capability evaluation, accounts, and the chat
//! facade used by both the REST handlers and the realtime gateway.

pub mod accounts;
pub mod capabilities;
pub mod chat;
pub mod error;
pub mod provider;
pub mod tokens;

mod store;

pub use error::{Error, Result};
