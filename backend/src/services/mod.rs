pub mod acr;
pub mod key_rotator;
pub mod maintenance;
pub mod session;
pub mod session_events;
pub mod session_policy;
pub mod stats;
