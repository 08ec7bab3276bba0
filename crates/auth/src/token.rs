//! Token issuing and verification.

use crate::error::{AuthError, AuthResult};
use crate::identity::{self, AuthDriver, UserIdentity};
use crate::keys::IssuerKeySet;
use jsonwebtoken::{Header, Validation, decode, decode_header, encode};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;
use wharf_core::error::{RegistryError, RegistryErrorCode};
use wharf_core::scope::{Scope, ScopeSet};
use wharf_core::{Configuration, TOKEN_CLOCK_SKEW_SECS, TOKEN_LIFETIME_SECS};

/// The audiences tokens can be issued for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Audience {
    /// This deployment's own public hostname.
    Local,
    /// The shared anycast hostname served by a group of peers.
    Anycast,
}

/// The result of verifying a token, and the input to issuing one.
pub struct Authorization {
    pub user_identity: Box<dyn UserIdentity>,
    pub scope_set: ScopeSet,
    pub audience: Audience,
}

impl std::fmt::Debug for Authorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorization")
            .field("user_identity", &self.user_identity.user_name())
            .field("scope_set", &self.scope_set)
            .field("audience", &self.audience)
            .finish()
    }
}

/// The format expected by docker clients from a token endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
    pub expires_in: u64,
    pub issued_at: String,
}

#[derive(Serialize, Deserialize)]
struct Claims {
    iss: String,
    sub: String,
    aud: String,
    exp: i64,
    nbf: i64,
    iat: i64,
    jti: String,
    access: Vec<Scope>,
    /// Embedded identity, `{"<type>": <payload>}`.
    wia: serde_json::Value,
}

/// Issues and verifies bearer tokens for both audiences.
pub struct TokenEngine {
    api_public_hostname: String,
    anycast_public_hostname: Option<String>,
    local_keys: IssuerKeySet,
    anycast_keys: IssuerKeySet,
}

impl TokenEngine {
    pub fn new(cfg: &Configuration) -> AuthResult<Self> {
        Ok(Self {
            api_public_hostname: cfg.api_public_hostname.clone(),
            anycast_public_hostname: cfg.anycast_public_hostname.clone(),
            local_keys: IssuerKeySet::from_pems(&cfg.issuer_keys)?,
            anycast_keys: IssuerKeySet::from_pems(&cfg.anycast_issuer_keys)?,
        })
    }

    fn keys_for(&self, audience: Audience) -> &IssuerKeySet {
        match audience {
            Audience::Local => &self.local_keys,
            Audience::Anycast => &self.anycast_keys,
        }
    }

    fn hostname_for(&self, audience: Audience) -> AuthResult<&str> {
        match audience {
            Audience::Local => Ok(&self.api_public_hostname),
            Audience::Anycast => self
                .anycast_public_hostname
                .as_deref()
                .ok_or(AuthError::MissingAudience),
        }
    }

    fn local_issuer(&self) -> String {
        format!("wharf-api@{}", self.api_public_hostname)
    }

    /// Render an authorization into a signed bearer token.
    pub fn issue(&self, authz: &Authorization) -> AuthResult<TokenResponse> {
        let key = self.keys_for(authz.audience).signing_key()?;
        let public_host = self.hostname_for(authz.audience)?;

        let now = OffsetDateTime::now_utc();
        let expires_at = now + time::Duration::seconds(TOKEN_LIFETIME_SECS as i64);

        let claims = Claims {
            iss: self.local_issuer(),
            sub: authz.user_identity.user_name(),
            aud: public_host.to_string(),
            exp: expires_at.unix_timestamp(),
            nbf: now.unix_timestamp(),
            iat: now.unix_timestamp(),
            jti: Uuid::new_v4().to_string(),
            access: authz.scope_set.flatten(),
            wia: identity::serialize_identity(authz.user_identity.as_ref())?,
        };

        // remember which key signed this token, so verification can pick the
        // right one out of the configured list
        let mut header = Header::new(key.algorithm());
        header.kid = Some(key.fingerprint().to_string());

        let token = encode(&header, &claims, key.encoding_key())
            .map_err(|e| AuthError::Signing(e.to_string()))?;

        Ok(TokenResponse {
            token,
            expires_in: TOKEN_LIFETIME_SECS,
            issued_at: now.format(&Rfc3339).map_err(|e| AuthError::Signing(e.to_string()))?,
        })
    }

    /// Verify a bearer token for the given audience.
    ///
    /// All failure modes collapse into `UNAUTHORIZED`; the detail names the
    /// specific reason.
    pub fn verify(
        &self,
        audience: Audience,
        token_str: &str,
        driver: &dyn AuthDriver,
    ) -> Result<Authorization, RegistryError> {
        let unauthorized = |msg: String| RegistryErrorCode::Unauthorized.with(msg);

        let header =
            decode_header(token_str).map_err(|e| unauthorized(format!("malformed token: {e}")))?;
        let kid = header
            .kid
            .ok_or_else(|| unauthorized("token has no key id".into()))?;
        let key = self
            .keys_for(audience)
            .find(&kid)
            .ok_or_else(|| unauthorized("token signed by unknown key".into()))?;
        if header.alg != key.algorithm() {
            return Err(unauthorized(format!(
                "unexpected signing method: {:?}",
                header.alg
            )));
        }

        let public_host = self
            .hostname_for(audience)
            .map_err(|e| unauthorized(e.to_string()))?;

        let mut validation = Validation::new(key.algorithm());
        validation.leeway = TOKEN_CLOCK_SKEW_SECS;
        validation.validate_nbf = true;
        validation.set_audience(&[public_host]);
        if audience == Audience::Local {
            validation.set_issuer(&[self.local_issuer()]);
        }
        // NOTE: for anycast tokens the issuer is not checked; any of our
        // peers could have issued the token.

        let data = decode::<Claims>(token_str, key.decoding_key(), &validation)
            .map_err(|e| unauthorized(e.to_string()))?;

        let user_identity = identity::deserialize_identity(driver, &data.claims.wia)
            .map_err(|e| unauthorized(e.to_string()))?;

        let scope_set: ScopeSet = data.claims.access.into_iter().collect();

        Ok(Authorization {
            user_identity,
            scope_set,
            audience,
        })
    }
}
