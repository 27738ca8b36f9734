use crate::error::PayoutError;
use crate::types::PasscodePurpose;
use async_trait::async_trait;

/// One-time passcode delivery and verification.
///
/// Delivery itself (email, SMS) is owned by the implementation; this core only
/// needs a challenge id back and a yes/no answer on verification.
#[async_trait]
pub trait PasscodeChannel: Send + Sync {
    fn channel_name(&self) -> &'static str;

    /// Send a passcode to `destination` (the user id) and return the
    /// challenge id the code is bound to.
    async fn send(&self, destination: &str, purpose: PasscodePurpose)
        -> Result<String, PayoutError>;

    async fn verify(&self, challenge_id: &str, code: &str) -> Result<bool, PayoutError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Accepts a single fixed code for every challenge it issued.
    #[derive(Debug)]
    pub struct FixedCodeChannel {
        code: String,
        issued: Mutex<HashMap<String, String>>,
        failing: AtomicBool,
        verifications: AtomicUsize,
    }

    impl FixedCodeChannel {
        pub fn new(code: &str) -> Self {
            Self {
                code: code.to_string(),
                issued: Mutex::new(HashMap::new()),
                failing: AtomicBool::new(false),
                verifications: AtomicUsize::new(0),
            }
        }

        pub fn sent_count(&self) -> usize {
            self.issued.lock().unwrap().len()
        }

        /// While set, `send` fails without issuing anything.
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn verify_count(&self) -> usize {
            self.verifications.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PasscodeChannel for FixedCodeChannel {
        fn channel_name(&self) -> &'static str {
            "fixed"
        }

        async fn send(
            &self,
            destination: &str,
            _purpose: PasscodePurpose,
        ) -> Result<String, PayoutError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(PayoutError::PasscodeChannel {
                    channel: self.channel_name().to_string(),
                    message: "delivery refused".to_string(),
                });
            }
            let challenge_id = Uuid::new_v4().to_string();
            self.issued
                .lock()
                .unwrap()
                .insert(challenge_id.clone(), destination.to_string());
            Ok(challenge_id)
        }

        async fn verify(&self, challenge_id: &str, code: &str) -> Result<bool, PayoutError> {
            self.verifications.fetch_add(1, Ordering::SeqCst);
            Ok(self.issued.lock().unwrap().contains_key(challenge_id) && code == self.code)
        }
    }
}
