//! User identities and the auth driver seam.
//!
//! The identity carried in a token is driver-specific. On the wire it is a
//! single-key JSON object `{"<type>": <payload>}` where the type names the
//! deserializer. Deserialization needs the auth driver, so the driver is
//! passed explicitly into every parse call.

use crate::error::{AuthError, AuthResult};
use async_trait::async_trait;
use wharf_core::error::RegistryError;

/// Permissions an identity can hold on an auth tenant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Permission {
    Pull,
    Push,
    Delete,
    Change,
}

impl Permission {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pull" => Some(Self::Pull),
            "push" => Some(Self::Push),
            "delete" => Some(Self::Delete),
            "change" => Some(Self::Change),
            _ => None,
        }
    }
}

/// An authenticated user, as understood by the configured auth driver.
pub trait UserIdentity: Send + Sync {
    /// The user name reported as the token subject.
    fn user_name(&self) -> String;

    /// Whether this identity holds `perm` on the given auth tenant.
    fn has_permission(&self, perm: Permission, auth_tenant_id: &str) -> bool;

    /// The type tag used in the embedded identity encoding.
    fn identity_type(&self) -> &'static str;

    /// The driver-specific payload of the embedded identity encoding.
    fn serialize_payload(&self) -> AuthResult<serde_json::Value>;
}

/// The auth driver seam: authentication plus identity (de)serialization.
#[async_trait]
pub trait AuthDriver: Send + Sync {
    /// Check a user name / password pair.
    async fn authenticate_user(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn UserIdentity>, RegistryError>;

    /// Reconstruct an identity from its embedded encoding.
    fn deserialize_identity(
        &self,
        type_name: &str,
        payload: &serde_json::Value,
    ) -> AuthResult<Box<dyn UserIdentity>>;
}

/// Encode an identity as the single-key wire object.
pub fn serialize_identity(identity: &dyn UserIdentity) -> AuthResult<serde_json::Value> {
    let payload = identity.serialize_payload()?;
    Ok(serde_json::json!({ identity.identity_type(): payload }))
}

/// Decode the single-key wire object back into an identity.
pub fn deserialize_identity(
    driver: &dyn AuthDriver,
    value: &serde_json::Value,
) -> AuthResult<Box<dyn UserIdentity>> {
    let obj = value
        .as_object()
        .ok_or_else(|| AuthError::Identity("embedded identity is not an object".into()))?;
    if obj.len() != 1 {
        return Err(AuthError::Identity(format!(
            "embedded identity must have exactly one component, got {}",
            obj.len()
        )));
    }
    let (type_name, payload) = obj
        .iter()
        .next()
        .ok_or_else(|| AuthError::Identity("embedded identity is empty".into()))?;
    driver.deserialize_identity(type_name, payload)
}
