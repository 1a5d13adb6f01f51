// Credential pool module
// Loads, refreshes, rotates, and disables upstream bearer credentials

mod refresh;
mod sources;
mod store;
mod types;

pub use store::{CredentialStore, StoreConfig};
pub use types::Credential;
