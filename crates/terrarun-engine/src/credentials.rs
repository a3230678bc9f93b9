// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run-scoped bearer credentials.
//!
//! Agent job tokens and task callback access tokens share one format:
//!
//! ```text
//! base64url(<run_id>.<expiry_unix>) "." hex(hmac_sha256(secret, body))
//! ```
//!
//! Tokens carry no server-side state. A token is only ever good for the one
//! Run it names, and only until it expires.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Issues and verifies run-scoped credentials with a shared secret.
#[derive(Clone)]
pub struct Credentials {
    secret: Vec<u8>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").finish_non_exhaustive()
    }
}

impl Credentials {
    /// Create a credential authority for `secret`.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Issue a token for `run_id` valid for `ttl` from now.
    pub fn issue(&self, run_id: &str, ttl: Duration) -> Result<String> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::InvalidCredential(format!("ttl out of range: {}", e)))?;
        self.issue_at(run_id, Utc::now() + ttl)
    }

    /// Issue a token for `run_id` that expires at `expires_at`.
    pub fn issue_at(&self, run_id: &str, expires_at: DateTime<Utc>) -> Result<String> {
        let body = URL_SAFE_NO_PAD.encode(format!("{}.{}", run_id, expires_at.timestamp()));
        let signature = hex::encode(self.mac(body.as_bytes())?.finalize().into_bytes());
        Ok(format!("{}.{}", body, signature))
    }

    /// Check a token and return the Run it was issued for.
    pub fn verify(&self, token: &str) -> Result<String> {
        self.verify_at(token, Utc::now())
    }

    /// Check a token against the clock value `now`.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<String> {
        let (body, signature) = token
            .split_once('.')
            .ok_or_else(|| Error::InvalidCredential("malformed token".into()))?;
        let signature = hex::decode(signature)
            .map_err(|_| Error::InvalidCredential("malformed signature".into()))?;

        // verify_slice compares in constant time
        self.mac(body.as_bytes())?
            .verify_slice(&signature)
            .map_err(|_| Error::InvalidCredential("bad signature".into()))?;

        let decoded = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| Error::InvalidCredential("malformed body".into()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| Error::InvalidCredential("malformed body".into()))?;
        let (run_id, expiry) = decoded
            .rsplit_once('.')
            .ok_or_else(|| Error::InvalidCredential("malformed body".into()))?;
        let expiry: i64 = expiry
            .parse()
            .map_err(|_| Error::InvalidCredential("malformed expiry".into()))?;

        if now.timestamp() >= expiry {
            return Err(Error::InvalidCredential("token expired".into()));
        }
        Ok(run_id.to_string())
    }

    fn mac(&self, body: &[u8]) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| Error::InvalidCredential(format!("invalid key: {}", e)))?;
        mac.update(body);
        Ok(mac)
    }
}
