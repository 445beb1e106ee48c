//! # Auth — Phone OTP Login and Bearer Tokens
//!
//! Users sign in with a phone number: `send_otp` issues a 6-digit code,
//! `verify_otp` consumes it and returns an HS256 bearer token. Every other
//! component only ever sees the `user_id` recovered from that token.
//!
//! Codes are stored as SHA-256 hex digests. Issuing a code invalidates any
//! earlier unconsumed code for the same phone. Delivery is delegated to an
//! [`OtpSender`]; the bundled [`LogOtpSender`] writes the code to the log and
//! is meant for development only.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::User;
use crate::retry::RetryPolicy;
use crate::store::ProgressStore;

pub const OTP_DIGITS: usize = 6;
pub const MAX_DISPLAY_NAME_LEN: usize = 64;

// ── Tokens ──────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub phone_number: String,
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
    pub jti: String,
}

#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    ttl: chrono::Duration,
}

impl JwtService {
    pub fn new(secret: &str, issuer: String, ttl: chrono::Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer,
            ttl,
        }
    }

    pub fn create_token(&self, user: &User) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user.user_id.to_string(),
            phone_number: user.phone_number.clone(),
            exp: (now + self.ttl).timestamp(),
            iat: now.timestamp(),
            iss: self.issuer.clone(),
            jti: Uuid::new_v4().to_string(),
        };
        encode(&Header::default(), &claims, &self.encoding_key).map_err(Into::into)
    }

    /// Verify signature, expiry and issuer.
    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::default();
        validation.set_issuer(&[&self.issuer]);
        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(Into::into)
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }
}

// ── OTP delivery ────────────────────────────────────────────────

#[async_trait]
pub trait OtpSender: Send + Sync {
    async fn send(&self, phone_number: &str, code: &str) -> Result<()>;
}

pub struct LogOtpSender;

#[async_trait]
impl OtpSender for LogOtpSender {
    async fn send(&self, phone_number: &str, code: &str) -> Result<()> {
        warn!(phone = %mask_phone(phone_number), code, "development OTP sender, code not delivered");
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────

/// Strip spaces and dashes, then require an optional `+` and 7 to 15 digits.
pub fn normalize_phone(raw: &str) -> Result<String, EngineError> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect();
    let digits = cleaned.strip_prefix('+').unwrap_or(&cleaned);
    if (7..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit()) {
        Ok(cleaned)
    } else {
        Err(EngineError::InvalidInput(format!("invalid phone number: {}", raw)))
    }
}

pub fn validate_display_name(raw: &str) -> Result<String, EngineError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(EngineError::InvalidInput("name must not be empty".into()));
    }
    if name.chars().count() > MAX_DISPLAY_NAME_LEN {
        return Err(EngineError::InvalidInput(format!(
            "name must be at most {} characters",
            MAX_DISPLAY_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

pub fn generate_otp() -> String {
    let mut rng = rand::thread_rng();
    (0..OTP_DIGITS)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

pub fn hash_otp(phone_number: &str, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(phone_number.as_bytes());
    hasher.update(b":");
    hasher.update(code.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn mask_phone(phone_number: &str) -> String {
    let visible = phone_number.len().saturating_sub(4);
    format!("{}{}", "*".repeat(visible), &phone_number[visible..])
}

// ── Identity service ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OtpIssued {
    pub phone_number: String,
    pub expires_in_seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in_seconds: i64,
    pub is_new_user: bool,
    pub user: User,
}

pub struct IdentityService {
    store: Arc<dyn ProgressStore>,
    jwt: JwtService,
    sender: Arc<dyn OtpSender>,
    retry: RetryPolicy,
    otp_ttl: chrono::Duration,
}

impl IdentityService {
    pub fn new(
        store: Arc<dyn ProgressStore>,
        jwt: JwtService,
        sender: Arc<dyn OtpSender>,
        retry: RetryPolicy,
        otp_ttl: chrono::Duration,
    ) -> Self {
        Self {
            store,
            jwt,
            sender,
            retry,
            otp_ttl,
        }
    }

    pub fn jwt(&self) -> &JwtService {
        &self.jwt
    }

    pub async fn send_otp(&self, phone_number: &str) -> Result<OtpIssued, EngineError> {
        let phone = normalize_phone(phone_number)?;
        let code = generate_otp();
        let code_hash = hash_otp(&phone, &code);
        let expires_at = Utc::now() + self.otp_ttl;
        self.retry
            .run("store_otp", || self.store.store_otp(&phone, &code_hash, expires_at))
            .await?;
        self.sender
            .send(&phone, &code)
            .await
            .map_err(|e| EngineError::Internal(e.context("otp delivery failed")))?;
        info!(phone = %mask_phone(&phone), "otp issued");
        Ok(OtpIssued {
            phone_number: phone,
            expires_in_seconds: self.otp_ttl.num_seconds(),
        })
    }

    /// Consume a code and sign the user in, creating the account on first
    /// login. New users must supply `name`; this is checked before the code is
    /// consumed so a missing name does not burn it.
    pub async fn verify_otp(
        &self,
        phone_number: &str,
        code: &str,
        name: Option<&str>,
    ) -> Result<Session, EngineError> {
        let phone = normalize_phone(phone_number)?;
        let code = code.trim();
        if code.len() != OTP_DIGITS || !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(EngineError::InvalidInput(format!(
                "code must be {} digits",
                OTP_DIGITS
            )));
        }

        let existing = self
            .retry
            .run("get_user_by_phone", || self.store.get_user_by_phone(&phone))
            .await?;
        let new_name = match (&existing, name) {
            (Some(_), _) => None,
            (None, Some(n)) => Some(validate_display_name(n)?),
            (None, None) => {
                return Err(EngineError::InvalidInput(
                    "name is required for new users".into(),
                ))
            }
        };

        let code_hash = hash_otp(&phone, code);
        let now = Utc::now();
        let consumed = self
            .retry
            .run("consume_otp", || self.store.consume_otp(&phone, &code_hash, now))
            .await?;
        if !consumed {
            return Err(EngineError::Unauthorized("invalid or expired code".into()));
        }

        let (user, is_new_user) = match (existing, new_name) {
            (Some(user), _) => (user, false),
            (None, Some(name)) => {
                let user = self
                    .retry
                    .run("create_user", || self.store.create_user(&phone, &name))
                    .await?;
                (user, true)
            }
            (None, None) => {
                return Err(EngineError::Internal(anyhow::anyhow!(
                    "new user without a validated name"
                )))
            }
        };

        let access_token = self.jwt.create_token(&user)?;
        info!(user_id = %user.user_id, is_new_user, "user signed in");
        Ok(Session {
            access_token,
            token_type: "bearer",
            expires_in_seconds: self.jwt.ttl().num_seconds(),
            is_new_user,
            user,
        })
    }

    /// Resolve a bearer token to a live user.
    pub async fn authenticate(&self, token: &str) -> Result<User, EngineError> {
        let claims = self
            .jwt
            .verify_token(token)
            .map_err(|e| EngineError::Unauthorized(e.to_string()))?;
        let user_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| EngineError::Unauthorized("malformed subject".into()))?;
        self.retry
            .run("get_user", || self.store.get_user(user_id))
            .await?
            .ok_or_else(|| EngineError::Unauthorized("unknown user".into()))
    }

    pub async fn update_display_name(&self, user_id: Uuid, name: &str) -> Result<User, EngineError> {
        let name = validate_display_name(name)?;
        self.retry
            .run("update_display_name", || self.store.update_display_name(user_id, &name))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("user {}", user_id)))
    }
}
