//! Auth driver implementations and the name-based driver registry.

use crate::error::{AuthError, AuthResult};
use crate::identity::{AuthDriver, Permission, UserIdentity};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use wharf_core::config::{AuthConfig, StaticUser};
use wharf_core::error::{RegistryError, RegistryErrorCode};

/// Identity produced by the static auth driver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StaticIdentity {
    username: String,
    grants: HashMap<String, Vec<String>>,
}

impl UserIdentity for StaticIdentity {
    fn user_name(&self) -> String {
        self.username.clone()
    }

    fn has_permission(&self, perm: Permission, auth_tenant_id: &str) -> bool {
        self.grants
            .get(auth_tenant_id)
            .is_some_and(|granted| granted.iter().filter_map(|g| Permission::parse(g)).any(|g| g == perm))
    }

    fn identity_type(&self) -> &'static str {
        "static"
    }

    fn serialize_payload(&self) -> AuthResult<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| AuthError::Identity(e.to_string()))
    }
}

/// Auth driver backed by a fixed user list from configuration.
pub struct StaticAuthDriver {
    users: Vec<StaticUser>,
}

impl StaticAuthDriver {
    pub fn new(users: Vec<StaticUser>) -> Self {
        Self { users }
    }

    fn identity_of(&self, user: &StaticUser) -> StaticIdentity {
        StaticIdentity {
            username: user.username.clone(),
            grants: user.grants.clone(),
        }
    }

    /// Build an identity without a password check. Test helper.
    pub fn identity_for_test(&self, username: &str) -> Box<dyn UserIdentity> {
        let user = self
            .users
            .iter()
            .find(|u| u.username == username)
            .expect("unknown test user");
        Box::new(self.identity_of(user))
    }
}

#[async_trait]
impl AuthDriver for StaticAuthDriver {
    async fn authenticate_user(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn UserIdentity>, RegistryError> {
        let user = self
            .users
            .iter()
            .find(|u| u.username == username && u.password == password)
            .ok_or_else(|| {
                RegistryErrorCode::Unauthorized.with("wrong credentials")
            })?;
        Ok(Box::new(self.identity_of(user)))
    }

    fn deserialize_identity(
        &self,
        type_name: &str,
        payload: &serde_json::Value,
    ) -> AuthResult<Box<dyn UserIdentity>> {
        if type_name != "static" {
            return Err(AuthError::Identity(format!(
                "unknown identity type: {type_name}"
            )));
        }
        let identity: StaticIdentity = serde_json::from_value(payload.clone())
            .map_err(|e| AuthError::Identity(e.to_string()))?;
        Ok(Box::new(identity))
    }
}

type DriverConstructor = fn(&AuthConfig) -> AuthResult<Arc<dyn AuthDriver>>;

fn construct_static(cfg: &AuthConfig) -> AuthResult<Arc<dyn AuthDriver>> {
    let AuthConfig::Static { users } = cfg;
    Ok(Arc::new(StaticAuthDriver::new(users.clone())))
}

/// Registry of auth drivers by name.
const DRIVERS: &[(&str, DriverConstructor)] = &[("static", construct_static)];

/// Build the auth driver selected by the configuration.
pub fn auth_driver_from_config(cfg: &AuthConfig) -> AuthResult<Arc<dyn AuthDriver>> {
    let name = cfg.driver_name();
    let (_, constructor) = DRIVERS
        .iter()
        .find(|(n, _)| *n == name)
        .ok_or_else(|| AuthError::UnknownDriver(name.to_string()))?;
    constructor(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver_with_alice() -> StaticAuthDriver {
        let mut grants = HashMap::new();
        grants.insert("tenant1".to_string(), vec!["pull".to_string()]);
        StaticAuthDriver::new(vec![StaticUser {
            username: "alice".into(),
            password: "secret".into(),
            grants,
        }])
    }

    #[tokio::test]
    async fn test_authenticate_user() {
        let driver = driver_with_alice();
        let identity = driver.authenticate_user("alice", "secret").await.unwrap();
        assert_eq!(identity.user_name(), "alice");
        assert!(identity.has_permission(Permission::Pull, "tenant1"));
        assert!(!identity.has_permission(Permission::Push, "tenant1"));
        assert!(!identity.has_permission(Permission::Pull, "tenant2"));

        assert!(driver.authenticate_user("alice", "wrong").await.is_err());
        assert!(driver.authenticate_user("bob", "secret").await.is_err());
    }

    #[test]
    fn test_identity_wire_format_has_single_key() {
        let driver = driver_with_alice();
        let identity = driver.identity_for_test("alice");
        let encoded = crate::identity::serialize_identity(identity.as_ref()).unwrap();
        let obj = encoded.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert!(obj.contains_key("static"));

        let decoded = crate::identity::deserialize_identity(&driver, &encoded).unwrap();
        assert_eq!(decoded.user_name(), "alice");
    }
}
