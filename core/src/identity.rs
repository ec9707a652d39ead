/// Principal and credential resolution
///
/// Identity is issued elsewhere. Both chat roles go through the same
/// `IdentityProvider::resolve` step before the push channel is dialed, so the
/// transport never cares how the credential was obtained.
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Buyer,
    Operator,
}

/// Opaque bearer credential. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub display_name: String,
    pub role: Role,
    pub credential: Credential,
}

impl Principal {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        role: Role,
        credential: Credential,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            role,
            credential,
        }
    }

    pub fn is_operator(&self) -> bool {
        self.role == Role::Operator
    }
}

/// Supplies the principal the client acts as.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve(&self) -> Result<Principal>;
}

/// Provider for a principal that was already issued (token on the command line,
/// session restored by the host app).
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    principal: Principal,
}

impl StaticIdentity {
    pub fn new(principal: Principal) -> Self {
        Self { principal }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn resolve(&self) -> Result<Principal> {
        if self.principal.credential.is_empty() {
            return Err(SyncError::Transport(format!(
                "no credential for {}",
                self.principal.id
            )));
        }
        Ok(self.principal.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_debug_is_redacted() {
        let cred = Credential::new("secret-token");
        assert_eq!(format!("{:?}", cred), "Credential(***)");
        assert_eq!(cred.expose(), "secret-token");
    }

    #[tokio::test]
    async fn test_static_identity_rejects_empty_credential() {
        let empty = StaticIdentity::new(Principal::new(
            "u1",
            "Ann",
            Role::Buyer,
            Credential::new("  "),
        ));
        assert!(matches!(empty.resolve().await, Err(SyncError::Transport(_))));

        let ok = StaticIdentity::new(Principal::new(
            "op",
            "Support",
            Role::Operator,
            Credential::new("t"),
        ));
        assert!(ok.resolve().await.unwrap().is_operator());
    }
}
