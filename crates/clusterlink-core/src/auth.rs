//! Credential supply for connection establishment.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::Result;
use crate::topology::{Endpoint, ServiceKind};

/// Username and password, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Password.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// SASL PLAIN message: `\0username\0password`.
    pub fn sasl_plain(&self) -> Zeroizing<Vec<u8>> {
        let mut msg = Zeroizing::new(Vec::with_capacity(
            self.username.len() + self.password.len() + 2,
        ));
        msg.push(0);
        msg.extend_from_slice(self.username.as_bytes());
        msg.push(0);
        msg.extend_from_slice(self.password.as_bytes());
        msg
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Supplies credentials each time a connection is established.
///
/// The core asks once per connection and drops the credentials as soon as
/// the handshake is done.
pub trait Authenticator: Send + Sync {
    /// Credentials for `service` at `endpoint`, or `None` to connect
    /// without authenticating.
    fn credentials(&self, service: ServiceKind, endpoint: &Endpoint) -> Result<Option<Credentials>>;
}

/// Same username and password for every service.
#[derive(Debug, Clone)]
pub struct PasswordAuthenticator {
    credentials: Credentials,
}

impl PasswordAuthenticator {
    /// Creates the authenticator.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Credentials::new(username, password),
        }
    }
}

impl Authenticator for PasswordAuthenticator {
    fn credentials(&self, _service: ServiceKind, _endpoint: &Endpoint) -> Result<Option<Credentials>> {
        Ok(Some(self.credentials.clone()))
    }
}

/// Connects without credentials.
#[derive(Debug, Clone, Default)]
pub struct NoAuthenticator;

impl Authenticator for NoAuthenticator {
    fn credentials(&self, _service: ServiceKind, _endpoint: &Endpoint) -> Result<Option<Credentials>> {
        Ok(None)
    }
}
