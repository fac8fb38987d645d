// Copyright (c) 2026 Joseph Verdicchio and Timesink Contributors
// SPDX-License-Identifier: Apache-2.0

//! Signed step tokens.
//!
//! Wire form is `base64url(json claims) "." base64url(hmac_sha256(secret, payload))`,
//! both halves unpadded. Verification is stateless unless the authority was
//! built with single-use enabled, in which case a [`NonceLedger`] remembers
//! consumed nonces until their tokens expire.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::clock::Clock;

type HmacSha256 = Hmac<Sha256>;

const NONCE_BYTES: usize = 16;
const MIN_SECRET_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenConfig {
    pub ttl_ms: u64,
    pub single_use: bool,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 15 * 60 * 1000,
            single_use: false,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token issued for another session")]
    SessionMismatch,
    #[error("token issued for another trial")]
    TrialMismatch,
    #[error("token issued for an earlier step")]
    StepMismatch,
    #[error("token already used")]
    Replayed,
    #[error("token signing failed: {0}")]
    Signing(String),
}

impl TokenError {
    /// Stable label for logs and counters.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::BadSignature => "bad_signature",
            Self::Expired => "expired",
            Self::SessionMismatch => "session_mismatch",
            Self::TrialMismatch => "trial_mismatch",
            Self::StepMismatch => "step_mismatch",
            Self::Replayed => "replayed",
            Self::Signing(_) => "signing",
        }
    }

    /// Whether the caller presented a bad credential, as opposed to the
    /// server failing to mint one.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, Self::Signing(_))
    }
}

/// HMAC key. Never printed.
#[derive(Clone)]
pub struct TokenSecret(Vec<u8>);

impl TokenSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, TokenError> {
        let bytes = bytes.into();
        if bytes.len() < MIN_SECRET_BYTES {
            return Err(TokenError::Signing(format!(
                "secret must be at least {MIN_SECRET_BYTES} bytes"
            )));
        }
        Ok(Self(bytes))
    }

    pub fn generate() -> Result<Self, TokenError> {
        let mut bytes = vec![0u8; 32];
        getrandom::getrandom(&mut bytes)
            .map_err(|_| TokenError::Signing("random keygen failed".to_string()))?;
        Ok(Self(bytes))
    }

    fn mac(&self) -> Result<HmacSha256, TokenError> {
        HmacSha256::new_from_slice(&self.0).map_err(|err| TokenError::Signing(err.to_string()))
    }
}

impl fmt::Debug for TokenSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenSecret(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTokenClaims {
    pub session_id: String,
    pub trial_id: String,
    pub step: u32,
    pub nonce: String,
    pub expires_at_ms: u64,
}

/// Consumed nonces, each held until its token would have expired anyway.
#[derive(Debug, Default)]
pub struct NonceLedger {
    used: Mutex<HashMap<String, u64>>,
}

impl NonceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `nonce` as spent. Returns `false` if it was already spent.
    pub fn consume(&self, nonce: &str, expires_at_ms: u64, now_ms: u64) -> bool {
        let mut used = self.used.lock();
        used.retain(|_, exp| *exp > now_ms);
        if used.contains_key(nonce) {
            return false;
        }
        used.insert(nonce.to_string(), expires_at_ms);
        true
    }

    pub fn len(&self) -> usize {
        self.used.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct StepTokenAuthority {
    cfg: TokenConfig,
    secret: TokenSecret,
    clock: Arc<dyn Clock>,
    ledger: Option<NonceLedger>,
}

impl StepTokenAuthority {
    pub fn new(cfg: TokenConfig, secret: TokenSecret, clock: Arc<dyn Clock>) -> Self {
        let ledger = cfg.single_use.then(NonceLedger::new);
        Self {
            cfg,
            secret,
            clock,
            ledger,
        }
    }

    pub fn config(&self) -> TokenConfig {
        self.cfg
    }

    pub fn issue(&self, session_id: &str, trial_id: &str, step: u32) -> Result<String, TokenError> {
        let mut nonce = [0u8; NONCE_BYTES];
        getrandom::getrandom(&mut nonce)
            .map_err(|_| TokenError::Signing("nonce generation failed".to_string()))?;
        let claims = StepTokenClaims {
            session_id: session_id.to_string(),
            trial_id: trial_id.to_string(),
            step,
            nonce: hex::encode(nonce),
            expires_at_ms: self.clock.now_ms().saturating_add(self.cfg.ttl_ms),
        };
        self.encode(&claims)
    }

    /// Signs arbitrary claims. Exposed for tooling and tests that need
    /// tokens with chosen fields.
    pub fn encode(&self, claims: &StepTokenClaims) -> Result<String, TokenError> {
        let payload =
            serde_json::to_vec(claims).map_err(|err| TokenError::Signing(err.to_string()))?;
        let payload = URL_SAFE_NO_PAD.encode(payload);
        let mut mac = self.secret.mac()?;
        mac.update(payload.as_bytes());
        let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{payload}.{sig}"))
    }

    /// Checks the signature only. Expiry and field binding are left to
    /// [`Self::check`].
    pub fn verify(&self, token: &str) -> Result<StepTokenClaims, TokenError> {
        let (payload, sig) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let sig = URL_SAFE_NO_PAD
            .decode(sig)
            .map_err(|_| TokenError::Malformed)?;
        let mut mac = self.secret.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&sig)
            .map_err(|_| TokenError::BadSignature)?;
        let raw = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| TokenError::Malformed)?;
        serde_json::from_slice(&raw).map_err(|_| TokenError::Malformed)
    }

    /// Full acceptance test for a submission: signature, expiry, binding to
    /// the expected session and trial, and single use when enabled.
    pub fn check(
        &self,
        token: &str,
        session_id: &str,
        trial_id: &str,
    ) -> Result<StepTokenClaims, TokenError> {
        let claims = self.verify(token)?;
        let now = self.clock.now_ms();
        if now >= claims.expires_at_ms {
            return Err(TokenError::Expired);
        }
        if claims.session_id != session_id {
            return Err(TokenError::SessionMismatch);
        }
        if claims.trial_id != trial_id {
            return Err(TokenError::TrialMismatch);
        }
        if let Some(ledger) = &self.ledger {
            if !ledger.consume(&claims.nonce, claims.expires_at_ms, now) {
                return Err(TokenError::Replayed);
            }
        }
        Ok(claims)
    }
}
