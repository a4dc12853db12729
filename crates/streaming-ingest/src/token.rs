// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Key-pair authentication.
//!
//! [`TokenSigner`] turns [`Credentials`] into short-lived RS256 bearer tokens.
//! Signing is CPU-only, so callers keep a [`TokenCache`] and only re-sign when
//! the cached token gets close to expiry.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey};
use rsa::RsaPrivateKey;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::IngestError;

/// Hard cap the platform enforces on key-pair JWT lifetimes.
pub const MAX_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);
/// Default lifetime, leaving a minute of margin below the cap.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(59 * 60);
/// Cached tokens are re-signed once they are this close to expiry.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Identity material for key-pair authentication.
#[derive(Clone)]
pub struct Credentials {
    pub account_identifier: String,
    pub principal_id: String,
    pub private_key_pem: String,
    pub passphrase: Option<String>,
    /// `SHA256:<base64>` fingerprint of the public key; derived when absent.
    pub key_fingerprint: Option<String>,
}

impl Credentials {
    /// Reads the PEM-encoded private key at `path`.
    pub fn from_pem_file(
        account_identifier: impl Into<String>,
        principal_id: impl Into<String>,
        path: impl AsRef<Path>,
        passphrase: Option<String>,
        key_fingerprint: Option<String>,
    ) -> Result<Self, IngestError> {
        let path = path.as_ref();
        let private_key_pem = std::fs::read_to_string(path).map_err(|err| {
            IngestError::Key(format!("cannot read private key {}: {err}", path.display()))
        })?;
        Ok(Self {
            account_identifier: account_identifier.into(),
            principal_id: principal_id.into(),
            private_key_pem,
            passphrase,
            key_fingerprint,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("account_identifier", &self.account_identifier)
            .field("principal_id", &self.principal_id)
            .field("private_key_pem", &"<redacted>")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("key_fingerprint", &self.key_fingerprint)
            .finish()
    }
}

/// A signed credential with a hard expiry.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken {
    value: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl BearerToken {
    pub fn new(value: impl Into<String>, issued_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            issued_at,
            expires_at,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// True when the token expires within `margin` of `now`.
    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero());
        now + margin >= self.expires_at
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("value", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// Signs bearer tokens on behalf of one principal.
#[derive(Clone)]
pub struct TokenSigner {
    qualified_user: String,
    issuer: String,
    fingerprint: String,
    encoding_key: EncodingKey,
}

impl TokenSigner {
    /// Parses the private key and prepares the issuer/subject claims.
    ///
    /// Fails with [`IngestError::Key`] when the key cannot be read, decrypted
    /// or re-encoded. There is no retry for a malformed identity.
    pub fn new(credentials: Credentials) -> Result<Self, IngestError> {
        if credentials.account_identifier.trim().is_empty() {
            return Err(IngestError::Key("account identifier is empty".to_string()));
        }
        if credentials.principal_id.trim().is_empty() {
            return Err(IngestError::Key("principal id is empty".to_string()));
        }

        let key = load_private_key(
            &credentials.private_key_pem,
            credentials.passphrase.as_deref(),
        )?;
        let derived = public_key_fingerprint(&key)?;
        let fingerprint = match credentials.key_fingerprint {
            Some(configured) if configured.trim() != derived => {
                warn!(
                    configured = %configured.trim(),
                    derived = %derived,
                    "configured key fingerprint does not match the private key, using the configured value"
                );
                configured.trim().to_string()
            }
            _ => derived,
        };

        let der = key
            .to_pkcs1_der()
            .map_err(|err| IngestError::Key(format!("failed to encode private key: {err}")))?;
        let encoding_key = EncodingKey::from_rsa_der(der.as_bytes());

        let qualified_user = format!(
            "{}.{}",
            normalize_account(&credentials.account_identifier),
            credentials.principal_id.trim().to_ascii_uppercase()
        );
        let issuer = format!("{qualified_user}.{fingerprint}");
        debug!(subject = %qualified_user, "token signer ready");

        Ok(Self {
            qualified_user,
            issuer,
            fingerprint,
            encoding_key,
        })
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn subject(&self) -> &str {
        &self.qualified_user
    }

    pub fn sign(&self, audience: &str, ttl: Duration) -> Result<BearerToken, IngestError> {
        self.sign_at(audience, ttl, Utc::now())
    }

    /// Signs a token as if the current time were `now`.
    pub fn sign_at(
        &self,
        audience: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<BearerToken, IngestError> {
        if ttl.is_zero() {
            return Err(IngestError::Signature("token ttl must be positive".to_string()));
        }
        let ttl = if ttl > MAX_TOKEN_TTL {
            warn!(requested = ?ttl, "token ttl exceeds the 60 minute cap, clamping");
            MAX_TOKEN_TTL
        } else {
            ttl
        };

        let issued_at = now;
        let expires_at = issued_at
            + chrono::Duration::from_std(ttl)
                .map_err(|err| IngestError::Signature(err.to_string()))?;
        let claims = Claims {
            iss: &self.issuer,
            sub: &self.qualified_user,
            aud: audience,
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };
        let value = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|err| IngestError::Signature(err.to_string()))?;

        Ok(BearerToken::new(value, issued_at, expires_at))
    }
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner")
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

/// Keeps one control-plane token and re-signs only near expiry.
#[derive(Debug, Clone)]
pub struct TokenCache {
    signer: TokenSigner,
    audience: String,
    ttl: Duration,
    refresh_margin: Duration,
    current: Option<BearerToken>,
    signed: u64,
}

impl TokenCache {
    pub fn new(signer: TokenSigner, audience: impl Into<String>, ttl: Duration) -> Self {
        Self {
            signer,
            audience: audience.into(),
            ttl,
            refresh_margin: DEFAULT_REFRESH_MARGIN.min(ttl / 2),
            current: None,
            signed: 0,
        }
    }

    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    /// Returns the cached token, signing a new one if missing or near expiry.
    pub fn token(&mut self) -> Result<BearerToken, IngestError> {
        let now = Utc::now();
        match &self.current {
            Some(token) if !token.expires_within(self.refresh_margin, now) => Ok(token.clone()),
            _ => self.refresh(),
        }
    }

    /// Discards the cached token and signs a fresh one.
    pub fn refresh(&mut self) -> Result<BearerToken, IngestError> {
        let token = self.signer.sign(&self.audience, self.ttl)?;
        self.signed += 1;
        debug!(expires_at = %token.expires_at, "signed new bearer token");
        self.current = Some(token.clone());
        Ok(token)
    }

    /// Number of tokens signed so far.
    pub fn signatures(&self) -> u64 {
        self.signed
    }
}

/// Uppercases the account and strips any `.region.cloud` suffix.
pub fn normalize_account(account: &str) -> String {
    let trimmed = account.trim();
    let locator = trimmed.split('.').next().unwrap_or(trimmed);
    locator.to_ascii_uppercase()
}

fn load_private_key(pem: &str, passphrase: Option<&str>) -> Result<RsaPrivateKey, IngestError> {
    let pem = pem.trim();
    if pem.contains("BEGIN ENCRYPTED PRIVATE KEY") {
        let passphrase = passphrase.ok_or_else(|| {
            IngestError::Key("private key is encrypted but no passphrase was provided".to_string())
        })?;
        return RsaPrivateKey::from_pkcs8_encrypted_pem(pem, passphrase.as_bytes())
            .map_err(|err| IngestError::Key(format!("failed to decrypt private key: {err}")));
    }
    if pem.contains("BEGIN RSA PRIVATE KEY") {
        return RsaPrivateKey::from_pkcs1_pem(pem)
            .map_err(|err| IngestError::Key(format!("invalid PKCS#1 private key: {err}")));
    }
    RsaPrivateKey::from_pkcs8_pem(pem)
        .map_err(|err| IngestError::Key(format!("invalid PKCS#8 private key: {err}")))
}

fn public_key_fingerprint(key: &RsaPrivateKey) -> Result<String, IngestError> {
    let der = key
        .to_public_key()
        .to_public_key_der()
        .map_err(|err| IngestError::Key(format!("failed to encode public key: {err}")))?;
    let digest = Sha256::digest(der.as_bytes());
    Ok(format!("SHA256:{}", STANDARD.encode(digest)))
}
