//! Master key identifiers.

use std::str::FromStr;

use crate::error::KeyVaultError;

const KEYS_SEGMENT: &str = "/keys/";

/// Identifier of a master key: `{vault}/keys/{name}[/{version}]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyUri {
    vault: String,
    name: String,
    version: Option<String>,
}

impl KeyUri {
    /// Builds a URI from its parts.
    pub fn new(vault: impl Into<String>, name: impl Into<String>, version: Option<String>) -> Self {
        Self {
            vault: vault.into().trim_end_matches('/').to_string(),
            name: name.into(),
            version,
        }
    }

    /// Vault base URL.
    pub fn vault(&self) -> &str {
        &self.vault
    }

    /// Key name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key version, if pinned.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Same key pinned to `version`.
    pub fn with_version(&self, version: impl Into<String>) -> Self {
        Self {
            vault: self.vault.clone(),
            name: self.name.clone(),
            version: Some(version.into()),
        }
    }

    /// Same key without a version.
    pub fn unversioned(&self) -> Self {
        Self {
            vault: self.vault.clone(),
            name: self.name.clone(),
            version: None,
        }
    }
}

impl std::fmt::Display for KeyUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.vault, KEYS_SEGMENT, self.name)?;
        if let Some(version) = &self.version {
            write!(f, "/{}", version)?;
        }
        Ok(())
    }
}

impl FromStr for KeyUri {
    type Err = KeyVaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let index = s
            .find(KEYS_SEGMENT)
            .ok_or_else(|| KeyVaultError::InvalidKeyUri(s.to_string()))?;

        let vault = &s[..index];
        let mut segments = s[index + KEYS_SEGMENT.len()..].split('/');

        let name = segments.next().filter(|n| !n.is_empty());
        let version = segments.next().filter(|v| !v.is_empty());

        match (name, segments.next()) {
            (Some(name), None) if !vault.is_empty() => Ok(Self {
                vault: vault.to_string(),
                name: name.to_string(),
                version: version.map(str::to_string),
            }),
            _ => Err(KeyVaultError::InvalidKeyUri(s.to_string())),
        }
    }
}
