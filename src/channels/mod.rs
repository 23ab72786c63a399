//! Mailbox access: credentials and the Gmail history source.

pub mod credentials;
pub mod gmail;

pub use credentials::{CredentialsProvider, EnvCredentials, StaticCredentials};
pub use gmail::{GmailConfig, GmailSource};
