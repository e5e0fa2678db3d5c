pub mod grant_store;
pub mod key_set_store;
pub mod session_store;

pub use grant_store::GrantStore;
pub use key_set_store::KeySetStore;
pub use session_store::{SessionStore, UpdateOptions, UpdateOutcome};
