//! Credential resolution for upstream registries
//!
//! A [`Keychain`] maps a registry host to the credentials to present when
//! pulling from it. It is an injected capability: the transfer client
//! never reads credential stores itself, and the local cache registry is
//! always anonymous.

use std::collections::HashMap;

use oci_distribution::secrets::RegistryAuth;

/// Resolves per-registry-host credentials
pub trait Keychain: Send + Sync {
    /// Return the credentials to use for the given registry host.
    ///
    /// Hosts without configured credentials resolve to anonymous access.
    fn resolve(&self, registry: &str) -> RegistryAuth;
}

/// Keychain that resolves every registry to anonymous access
#[derive(Clone, Copy, Debug, Default)]
pub struct AnonymousKeychain;

impl Keychain for AnonymousKeychain {
    fn resolve(&self, _registry: &str) -> RegistryAuth {
        RegistryAuth::Anonymous
    }
}

/// Keychain backed by a fixed host → basic-credentials map
#[derive(Clone, Debug, Default)]
pub struct StaticKeychain {
    credentials: HashMap<String, (String, String)>,
}

impl StaticKeychain {
    /// Create an empty keychain (everything resolves to anonymous)
    pub fn new() -> Self {
        Self::default()
    }

    /// Register basic credentials for a registry host
    pub fn with_basic(
        mut self,
        registry: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials
            .insert(registry.into(), (username.into(), password.into()));
        self
    }
}

impl Keychain for StaticKeychain {
    fn resolve(&self, registry: &str) -> RegistryAuth {
        match self.credentials.get(registry) {
            Some((username, password)) => {
                RegistryAuth::Basic(username.clone(), password.clone())
            }
            None => RegistryAuth::Anonymous,
        }
    }
}
