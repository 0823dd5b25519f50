//! # Protocol Layer
//!
//! Middleware, dispatch, and the registered operations.
//!
//! ## Components
//! - **Middleware**: ordered inbound stages and the outbound wrap stage
//! - **Dispatcher**: per-connection serialized handler execution
//! - **Handshake**: ephemeral key exchange installing the session key
//! - **Accounts**: register, login, logout, change-password operations

pub mod accounts;
pub mod dispatcher;
pub mod handshake;
pub mod middleware;

/// Session permission ladder. Monotonically elevated by handshake (GUEST)
/// and login (the stored role); logout drops back to NONE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PermissionLevel {
    None = 0,
    Guest = 1,
    User = 2,
    Admin = 3,
}

impl PermissionLevel {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Guest,
            2 => Self::User,
            3 => Self::Admin,
            _ => Self::None,
        }
    }
}
