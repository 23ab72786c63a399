//! Mailbox credentials.

use secrecy::SecretString;

/// Supplies the OAuth refresh token used to read the mailbox.
pub trait CredentialsProvider: Send + Sync {
    /// `None` when the mailbox has not been connected.
    fn refresh_token(&self) -> Option<SecretString>;
}

/// Reads `GOOGLE_REFRESH_TOKEN` on every call, so a token set after startup is picked up.
#[derive(Debug, Default, Clone)]
pub struct EnvCredentials;

impl CredentialsProvider for EnvCredentials {
    fn refresh_token(&self) -> Option<SecretString> {
        std::env::var("GOOGLE_REFRESH_TOKEN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(SecretString::from)
    }
}

/// Fixed token, or none.
#[derive(Default)]
pub struct StaticCredentials(Option<String>);

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl CredentialsProvider for StaticCredentials {
    fn refresh_token(&self) -> Option<SecretString> {
        self.0.clone().map(SecretString::from)
    }
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn static_credentials() {
        let creds = StaticCredentials::new("rt-1");
        assert_eq!(creds.refresh_token().unwrap().expose_secret(), "rt-1");
        assert!(StaticCredentials::none().refresh_token().is_none());
    }
}
