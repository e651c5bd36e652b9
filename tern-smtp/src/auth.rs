//! SASL mechanics for `AUTH PLAIN` and `AUTH LOGIN`, and the credential
//! check sessions authenticate against.

use std::fmt::Debug;

use ahash::AHashMap;
use base64::{Engine, engine::general_purpose::STANDARD};
use tern_common::address::local_part;
use thiserror::Error;

/// Prompt sent before the username in `AUTH LOGIN` ("Username:").
pub const USERNAME_PROMPT: &str = "VXNlcm5hbWU6";
/// Prompt sent before the password in `AUTH LOGIN` ("Password:").
pub const PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid Base64")]
    InvalidBase64,

    #[error("Invalid arguments")]
    InvalidArguments,
}

/// The external credential check.
pub trait Credentials: Send + Sync + Debug {
    fn verify(&self, username: &str, password: &str) -> bool;
}

/// Credentials held in memory, keyed by lowercased address.
///
/// A username without a domain matches any user with that local part.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCredentials {
    users: AHashMap<String, String>,
}

impl InMemoryCredentials {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_user(mut self, email: &str, password: impl Into<String>) -> Self {
        self.users
            .insert(email.trim().to_ascii_lowercase(), password.into());
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl<S: AsRef<str>, P: Into<String>> FromIterator<(S, P)> for InMemoryCredentials {
    fn from_iter<T: IntoIterator<Item = (S, P)>>(iter: T) -> Self {
        iter.into_iter()
            .fold(Self::new(), |creds, (email, password)| {
                creds.with_user(email.as_ref(), password)
            })
    }
}

impl Credentials for InMemoryCredentials {
    fn verify(&self, username: &str, password: &str) -> bool {
        let username = username.trim().to_ascii_lowercase();

        if let Some(expected) = self.users.get(&username) {
            return expected == password;
        }

        !username.contains('@')
            && self
                .users
                .iter()
                .any(|(email, expected)| local_part(email) == username && expected == password)
    }
}

/// Decode one base64 client response into text.
pub fn decode(encoded: &str) -> Result<String, AuthError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthError::InvalidBase64)?;
    String::from_utf8(bytes).map_err(|_| AuthError::InvalidArguments)
}

/// Decode an `AUTH PLAIN` response into (authcid, password).
///
/// The payload is `authzid NUL authcid NUL password`; the authorisation
/// identity is accepted but not used.
pub fn decode_plain(encoded: &str) -> Result<(String, String), AuthError> {
    let decoded = decode(encoded)?;
    let mut parts = decoded.split('\0');

    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_authzid), Some(authcid), Some(password), None) if !authcid.is_empty() => {
            Ok((authcid.to_string(), password.to_string()))
        }
        _ => Err(AuthError::InvalidArguments),
    }
}
