//! Issuer key handling.
//!
//! An issuer key is an Ed25519 or RSA private key loaded from PEM. The JWS
//! algorithm follows from the key type (Ed25519 -> EdDSA, RSA -> RS256). Each
//! key carries a fingerprint that is written into the token header so that
//! verification can pick the right key out of the configured list.

use crate::error::{AuthError, AuthResult};
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use pkcs8::LineEnding;
use ed25519_dalek::SigningKey;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use rsa::pkcs8::EncodePublicKey;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::fmt;

/// A single issuer key pair.
pub struct IssuerKey {
    algorithm: Algorithm,
    fingerprint: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl IssuerKey {
    /// Parse a private key PEM. Ed25519 PKCS#8 and RSA (PKCS#8 or PKCS#1)
    /// keys are accepted.
    pub fn from_pem(pem: &str) -> AuthResult<Self> {
        if let Ok(signing_key) = SigningKey::from_pkcs8_pem(pem) {
            return Self::from_ed25519(pem, &signing_key);
        }

        let private = parse_rsa_private(pem)?;
        Self::from_rsa(pem, &private)
    }

    fn from_ed25519(pem: &str, signing_key: &SigningKey) -> AuthResult<Self> {
        let public_bytes = signing_key.verifying_key().to_bytes();
        let encoding = EncodingKey::from_ed_pem(pem.as_bytes())
            .map_err(|e| AuthError::KeyParsing(format!("invalid ed25519 key: {e}")))?;
        let decoding = DecodingKey::from_ed_der(&public_bytes);
        Ok(Self {
            algorithm: Algorithm::EdDSA,
            fingerprint: hex_encode(&public_bytes),
            encoding,
            decoding,
        })
    }

    fn from_rsa(pem: &str, private: &RsaPrivateKey) -> AuthResult<Self> {
        let public = RsaPublicKey::from(private);
        let public_der = public
            .to_public_key_der()
            .map_err(|e| AuthError::KeyParsing(format!("cannot encode RSA public key: {e}")))?;
        let public_pem = public
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| AuthError::KeyParsing(format!("cannot encode RSA public key: {e}")))?;

        let encoding = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| AuthError::KeyParsing(format!("invalid RSA key: {e}")))?;
        let decoding = DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .map_err(|e| AuthError::KeyParsing(format!("invalid RSA public key: {e}")))?;

        Ok(Self {
            algorithm: Algorithm::RS256,
            fingerprint: hex_encode(&Sha256::digest(public_der.as_bytes())),
            encoding,
            decoding,
        })
    }

    /// Generate a fresh Ed25519 key and return it together with its PEM.
    pub fn generate_ed25519() -> AuthResult<(Self, String)> {
        let mut rng = rand_core::OsRng;
        let signing_key = SigningKey::generate(&mut rng);
        let pem = signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| AuthError::KeyParsing(format!("cannot encode generated key: {e}")))?;
        let key = Self::from_ed25519(&pem, &signing_key)?;
        Ok((key, pem.to_string()))
    }

    /// The JWS algorithm this key signs with.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The fingerprint written into token headers.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub(crate) fn encoding_key(&self) -> &EncodingKey {
        &self.encoding
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }
}

impl fmt::Debug for IssuerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuerKey")
            .field("algorithm", &self.algorithm)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// An ordered list of issuer keys for one audience.
///
/// The first key is the active signer; the remaining keys are still accepted
/// during verification so that rotation does not invalidate live tokens.
#[derive(Debug, Default)]
pub struct IssuerKeySet {
    keys: Vec<IssuerKey>,
}

impl IssuerKeySet {
    pub fn from_pems(pems: &[String]) -> AuthResult<Self> {
        let keys = pems
            .iter()
            .map(|pem| IssuerKey::from_pem(pem))
            .collect::<AuthResult<Vec<_>>>()?;
        Ok(Self { keys })
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The key used to sign new tokens.
    pub fn signing_key(&self) -> AuthResult<&IssuerKey> {
        self.keys.first().ok_or(AuthError::NoIssuerKeys)
    }

    /// Find a verification key by its fingerprint.
    pub fn find(&self, fingerprint: &str) -> Option<&IssuerKey> {
        self.keys.iter().find(|k| k.fingerprint() == fingerprint)
    }
}

fn parse_rsa_private(pem: &str) -> AuthResult<RsaPrivateKey> {
    use rsa::pkcs1::DecodeRsaPrivateKey;
    use rsa::pkcs8::DecodePrivateKey;

    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| AuthError::KeyParsing(format!("not an Ed25519 or RSA private key: {e}")))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
