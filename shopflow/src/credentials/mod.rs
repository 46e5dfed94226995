//! Credential records and the set they are persisted in.

pub mod record;
pub mod set;

pub use record::{
    fingerprint, CredentialEntry, CredentialRecord, IncompleteCredential, ValidCredential,
    REQUIRED_FIELDS,
};
pub use set::{CredentialSet, PayloadStyle};
