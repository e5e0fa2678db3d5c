//! Entities kept in the storage tiers.

pub mod client_access;
pub mod grant;
pub mod key_set;
pub mod session;
