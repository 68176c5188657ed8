// Authentication module
// Manages the token lifecycle and the encrypted session that carries it

pub mod identity;
pub mod lifecycle;
mod manager;
pub mod oauth;
pub mod refresh;
pub mod store;
pub mod types;

pub use manager::AuthManager;
pub use types::{CredentialRecord, InitialGrant, Session, TokenStatus};
