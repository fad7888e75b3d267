//! Authentication and authorization
//!
//! This module provides:
//! - API key validation against sha256 digests from the config
//! - Role-based access control (RBAC)
//! - The `Authorizer` seam consulted before every entitled request

use crate::common::config::AuthConfig;
use crate::common::hash::sha256_hex;
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Role defining access levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Role {
    /// Full access including operation management
    Admin,
    /// Read and write access to volumes
    ReadWrite,
    /// Read-only access (default)
    #[default]
    ReadOnly,
}

impl Role {
    /// Check if this role can perform write operations
    pub fn can_write(&self) -> bool {
        matches!(self, Role::Admin | Role::ReadWrite)
    }

    /// Check if this role can perform admin operations
    pub fn can_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

/// What a request wants to do with an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entitlement {
    CanView,
    CanEdit,
    CanDelete,
    CanManageOperations,
}

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub role: Role,
}

impl Identity {
    /// Identity used when authentication is disabled
    pub fn unauthenticated() -> Self {
        Self {
            name: "anonymous".to_string(),
            role: Role::Admin,
        }
    }
}

/// Permission check consulted at the HTTP boundary
pub trait Authorizer: Send + Sync {
    fn check_permission(
        &self,
        identity: &Identity,
        entity_url: &str,
        entitlement: Entitlement,
    ) -> Result<()>;
}

/// Grants everything; used when auth is disabled
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn check_permission(&self, _: &Identity, _: &str, _: Entitlement) -> Result<()> {
        Ok(())
    }
}

/// Grants by role
pub struct RoleAuthorizer;

impl Authorizer for RoleAuthorizer {
    fn check_permission(
        &self,
        identity: &Identity,
        entity_url: &str,
        entitlement: Entitlement,
    ) -> Result<()> {
        let allowed = match entitlement {
            Entitlement::CanView => true,
            Entitlement::CanEdit | Entitlement::CanDelete => identity.role.can_write(),
            Entitlement::CanManageOperations => identity.role.can_admin(),
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "{} ({:?}) is not allowed to {:?} {}",
                identity.name, identity.role, entitlement, entity_url
            )))
        }
    }
}

/// Result of authentication attempt
#[derive(Debug)]
pub enum AuthResult {
    Ok(Identity),
    Missing,
    Invalid(String),
}

/// API key store keyed by sha256 digest
#[derive(Debug, Default)]
pub struct KeyStore {
    keys: HashMap<String, Identity>,
}

impl KeyStore {
    pub fn from_config(config: &AuthConfig) -> Self {
        let keys = config
            .keys
            .iter()
            .map(|k| {
                (
                    k.key_sha256.to_ascii_lowercase(),
                    Identity {
                        name: k.name.clone(),
                        role: k.role,
                    },
                )
            })
            .collect();
        Self { keys }
    }

    /// Validate a plaintext key
    pub fn validate_key(&self, key: &str) -> AuthResult {
        match self.keys.get(&sha256_hex(key.as_bytes())) {
            Some(identity) => AuthResult::Ok(identity.clone()),
            None => AuthResult::Invalid("unknown API key".to_string()),
        }
    }

    /// Authenticate an `Authorization` header value (`Bearer <key>`)
    pub fn authenticate(&self, header: &str) -> AuthResult {
        match header.strip_prefix("Bearer ") {
            Some(key) if !key.trim().is_empty() => self.validate_key(key.trim()),
            _ => AuthResult::Invalid("expected 'Bearer <key>'".to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::ApiKeySeed;

    fn store() -> KeyStore {
        KeyStore::from_config(&AuthConfig {
            enabled: true,
            keys: vec![
                ApiKeySeed {
                    name: "ops".into(),
                    key_sha256: sha256_hex(b"secret-ops"),
                    role: Role::Admin,
                },
                ApiKeySeed {
                    name: "viewer".into(),
                    key_sha256: sha256_hex(b"secret-view"),
                    role: Role::ReadOnly,
                },
            ],
        })
    }

    #[test]
    fn test_role_permissions() {
        assert!(Role::Admin.can_write());
        assert!(Role::Admin.can_admin());
        assert!(Role::ReadWrite.can_write());
        assert!(!Role::ReadWrite.can_admin());
        assert!(!Role::ReadOnly.can_write());
    }

    #[test]
    fn test_authenticate_bearer() {
        let store = store();
        match store.authenticate("Bearer secret-ops") {
            AuthResult::Ok(id) => assert_eq!(id.name, "ops"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            store.authenticate("Bearer nope"),
            AuthResult::Invalid(_)
        ));
        assert!(matches!(
            store.authenticate("Basic abc"),
            AuthResult::Invalid(_)
        ));
    }

    #[test]
    fn test_role_authorizer() {
        let viewer = Identity {
            name: "viewer".into(),
            role: Role::ReadOnly,
        };
        let url = "/1.0/storage-pools/default/volumes/custom/data";
        assert!(RoleAuthorizer
            .check_permission(&viewer, url, Entitlement::CanView)
            .is_ok());
        assert!(matches!(
            RoleAuthorizer.check_permission(&viewer, url, Entitlement::CanEdit),
            Err(Error::Forbidden(_))
        ));
    }
}
