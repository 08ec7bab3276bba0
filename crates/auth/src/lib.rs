//! Token issuing and verification for the Wharf registry.
//!
//! Bearer tokens are JWTs signed with one of a configurable, ordered list of
//! issuer keys per audience. The first key in the list signs new tokens; all
//! keys remain valid for verification, which is what makes key rotation and
//! anycast operation work. Tokens embed a driver-specific user identity.

pub mod drivers;
pub mod error;
pub mod identity;
pub mod keys;
pub mod token;

pub use drivers::{StaticAuthDriver, auth_driver_from_config};
pub use error::{AuthError, AuthResult};
pub use identity::{AuthDriver, Permission, UserIdentity};
pub use keys::{IssuerKey, IssuerKeySet};
pub use token::{Audience, Authorization, TokenEngine, TokenResponse};
