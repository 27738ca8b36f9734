use crate::error::PayoutError;
use serde::{Deserialize, Serialize};

/// Stages of the two-step withdrawal flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStage {
    Form,
    OtpRequested,
    Committed,
    Rejected,
    Cancelled,
    Expired,
}

impl WithdrawalStage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Form => "form",
            Self::OtpRequested => "otp_requested",
            Self::Committed => "committed",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Committed | Self::Rejected | Self::Cancelled | Self::Expired
        )
    }

    pub fn parse(value: &str) -> Result<Self, PayoutError> {
        match value {
            "form" => Ok(Self::Form),
            "otp_requested" => Ok(Self::OtpRequested),
            "committed" => Ok(Self::Committed),
            "rejected" => Ok(Self::Rejected),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(PayoutError::InvalidInput(format!(
                "unknown withdrawal stage '{other}'"
            ))),
        }
    }
}

/// Enforces form -> otp_requested -> committed, with rejection, cancellation
/// and expiry as the only exits. Terminal stages never move again.
#[derive(Debug, Clone)]
pub struct WithdrawalFlow {
    challenge_id: String,
    stage: WithdrawalStage,
}

impl WithdrawalFlow {
    pub fn new(challenge_id: impl Into<String>) -> Self {
        Self {
            challenge_id: challenge_id.into(),
            stage: WithdrawalStage::Form,
        }
    }

    /// Rebuild the machine from a persisted stage.
    pub fn resume(challenge_id: impl Into<String>, stage: WithdrawalStage) -> Self {
        Self {
            challenge_id: challenge_id.into(),
            stage,
        }
    }

    pub fn challenge_id(&self) -> &str {
        &self.challenge_id
    }

    pub fn stage(&self) -> WithdrawalStage {
        self.stage
    }

    pub fn mark_otp_requested(&mut self) -> Result<(), PayoutError> {
        self.advance(WithdrawalStage::Form, WithdrawalStage::OtpRequested)
    }

    pub fn mark_committed(&mut self) -> Result<(), PayoutError> {
        self.advance(WithdrawalStage::OtpRequested, WithdrawalStage::Committed)
    }

    pub fn mark_expired(&mut self) -> Result<(), PayoutError> {
        self.advance(WithdrawalStage::OtpRequested, WithdrawalStage::Expired)
    }

    pub fn mark_rejected(&mut self) -> Result<(), PayoutError> {
        self.exit(WithdrawalStage::Rejected)
    }

    pub fn mark_cancelled(&mut self) -> Result<(), PayoutError> {
        self.exit(WithdrawalStage::Cancelled)
    }

    fn exit(&mut self, terminal: WithdrawalStage) -> Result<(), PayoutError> {
        if self.stage.is_terminal() {
            return Err(PayoutError::InvariantViolation(format!(
                "challenge '{}' already {}; cannot move to {}",
                self.challenge_id,
                self.stage.name(),
                terminal.name()
            )));
        }
        self.stage = terminal;
        Ok(())
    }

    fn advance(
        &mut self,
        expected_current: WithdrawalStage,
        next: WithdrawalStage,
    ) -> Result<(), PayoutError> {
        if self.stage != expected_current {
            return Err(PayoutError::stage_violation(
                expected_current.name(),
                self.stage.name(),
            ));
        }
        self.stage = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_reaches_committed() {
        let mut flow = WithdrawalFlow::new("challenge-a");
        assert!(flow.mark_otp_requested().is_ok());
        assert!(flow.mark_committed().is_ok());
        assert_eq!(flow.stage(), WithdrawalStage::Committed);
    }

    #[test]
    fn rejects_commit_without_passcode_step() {
        let mut flow = WithdrawalFlow::new("challenge-b");
        let err = flow.mark_committed().unwrap_err();
        assert!(err
            .to_string()
            .contains("expected 'otp_requested', got 'form'"));
    }

    #[test]
    fn terminal_stages_are_final() {
        let mut flow = WithdrawalFlow::new("challenge-c");
        flow.mark_otp_requested().unwrap();
        flow.mark_rejected().unwrap();
        assert!(flow.mark_cancelled().is_err());
        assert!(flow.mark_committed().is_err());

        let mut committed = WithdrawalFlow::resume("challenge-d", WithdrawalStage::Committed);
        assert!(committed.mark_rejected().is_err());
    }

    #[test]
    fn rejection_is_allowed_from_form() {
        let mut flow = WithdrawalFlow::new("challenge-e");
        flow.mark_rejected().unwrap();
        assert_eq!(flow.stage(), WithdrawalStage::Rejected);
    }

    #[test]
    fn only_open_challenges_expire() {
        let mut flow = WithdrawalFlow::resume("challenge-f", WithdrawalStage::OtpRequested);
        flow.mark_expired().unwrap();
        assert!(flow.stage().is_terminal());
        assert!(WithdrawalFlow::new("challenge-g").mark_expired().is_err());
    }
}
