//! Passcode channel adapters for the payout engine.

#![deny(unsafe_code)]

use async_trait::async_trait;
use payout_core::error::PayoutError;
use payout_core::otp::PasscodeChannel;
use payout_core::types::PasscodePurpose;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

const CODE_KEY_CONTEXT: &str = "payout dev passcode 2026-01 six-digit codes";
const DEFAULT_RETENTION: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
struct IssuedCode {
    destination: String,
    purpose: PasscodePurpose,
    code: String,
    issued_at: Instant,
}

/// Local channel that derives six-digit codes from a secret and logs them
/// at debug level instead of delivering them. Never wire this into
/// production.
///
/// Codes are kept for `retention` after issue and dropped on the next send.
#[derive(Debug)]
pub struct DevPasscodeChannel {
    key: [u8; 32],
    retention: Duration,
    issued: Mutex<HashMap<String, IssuedCode>>,
}

impl DevPasscodeChannel {
    pub fn new(secret: &str) -> Self {
        Self {
            key: blake3::derive_key(CODE_KEY_CONTEXT, secret.as_bytes()),
            retention: DEFAULT_RETENTION,
            issued: Mutex::new(HashMap::new()),
        }
    }

    /// Match the retention to the challenge lifetime.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Code bound to a challenge, for tests and local tooling.
    pub fn issued_code(&self, challenge_id: &str) -> Option<String> {
        self.issued_codes()
            .get(challenge_id)
            .map(|issued| issued.code.clone())
    }

    fn issued_codes(&self) -> std::sync::MutexGuard<'_, HashMap<String, IssuedCode>> {
        match self.issued.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn derive_code(&self, challenge_id: &str, destination: &str) -> String {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(challenge_id.as_bytes());
        hasher.update(b"\0");
        hasher.update(destination.as_bytes());
        let digest = hasher.finalize();

        let mut head = [0_u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        format!("{:06}", u64::from_le_bytes(head) % 1_000_000)
    }
}

#[async_trait]
impl PasscodeChannel for DevPasscodeChannel {
    fn channel_name(&self) -> &'static str {
        "dev"
    }

    async fn send(
        &self,
        destination: &str,
        purpose: PasscodePurpose,
    ) -> Result<String, PayoutError> {
        let challenge_id = Uuid::new_v4().to_string();
        let code = self.derive_code(&challenge_id, destination);
        tracing::info!(
            destination,
            challenge_id = %challenge_id,
            purpose = purpose.as_str(),
            "dev passcode issued"
        );
        tracing::debug!(challenge_id = %challenge_id, code = %code, "dev passcode");

        let mut issued = self.issued_codes();
        let before = issued.len();
        issued.retain(|_, entry| entry.issued_at.elapsed() < self.retention);
        if issued.len() < before {
            tracing::debug!(evicted = before - issued.len(), "dev passcodes expired");
        }
        issued.insert(
            challenge_id.clone(),
            IssuedCode {
                destination: destination.to_string(),
                purpose,
                code,
                issued_at: Instant::now(),
            },
        );
        Ok(challenge_id)
    }

    async fn verify(&self, challenge_id: &str, code: &str) -> Result<bool, PayoutError> {
        let issued = self.issued_codes().get(challenge_id).cloned();
        Ok(match issued {
            Some(issued) => {
                tracing::debug!(
                    destination = %issued.destination,
                    purpose = issued.purpose.as_str(),
                    "dev passcode checked"
                );
                issued.code == code
            }
            None => false,
        })
    }
}

/// Channel whose delivery always fails, for exercising error paths.
#[derive(Debug, Clone)]
pub struct FailingPasscodeChannel {
    reason: String,
}

impl FailingPasscodeChannel {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn failure(&self) -> PayoutError {
        PayoutError::PasscodeChannel {
            channel: self.channel_name().to_string(),
            message: self.reason.clone(),
        }
    }
}

#[async_trait]
impl PasscodeChannel for FailingPasscodeChannel {
    fn channel_name(&self) -> &'static str {
        "failing"
    }

    async fn send(
        &self,
        _destination: &str,
        _purpose: PasscodePurpose,
    ) -> Result<String, PayoutError> {
        Err(self.failure())
    }

    async fn verify(&self, _challenge_id: &str, _code: &str) -> Result<bool, PayoutError> {
        Err(self.failure())
    }
}
