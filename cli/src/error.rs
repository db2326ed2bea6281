//! Error Taxonomy
//!
//! Every failure the core reports is a [`LoanError`]. Raw provider and ledger
//! failures enter as [`RawFailure`] and are classified exactly once, here.

use crate::lifecycle::Action;
use crate::types::{LoanId, TxHash};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Wallet code for "the user declined the prompt" (EIP-1193).
pub const CODE_USER_REJECTED: i64 = 4001;
/// Wallet code for "this chain is not known to the wallet".
pub const CODE_UNRECOGNIZED_CHAIN: i64 = 4902;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    UserRejected,
    NetworkMismatch,
    InsufficientFunds,
    InvalidState,
    Expired,
    ContractPaused,
    ContractReverted,
    NotConnected,
    DuplicateSubmission,
    ConfirmationTimeout,
    Transport,
    MalformedRecord,
}

impl ErrorKind {
    /// Whether resubmitting after the user fixes their situation can succeed.
    pub fn is_recoverable(self) -> bool {
        match self {
            ErrorKind::UserRejected
            | ErrorKind::NetworkMismatch
            | ErrorKind::InsufficientFunds
            | ErrorKind::ContractPaused
            | ErrorKind::NotConnected
            | ErrorKind::DuplicateSubmission
            | ErrorKind::ConfirmationTimeout
            | ErrorKind::Transport => true,
            ErrorKind::InvalidState
            | ErrorKind::Expired
            | ErrorKind::ContractReverted
            | ErrorKind::MalformedRecord => false,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::UserRejected => "User Rejected",
            ErrorKind::NetworkMismatch => "Network Mismatch",
            ErrorKind::InsufficientFunds => "Insufficient Funds",
            ErrorKind::InvalidState => "Invalid State",
            ErrorKind::Expired => "Expired",
            ErrorKind::ContractPaused => "Contract Paused",
            ErrorKind::ContractReverted => "Contract Reverted",
            ErrorKind::NotConnected => "Not Connected",
            ErrorKind::DuplicateSubmission => "Duplicate Submission",
            ErrorKind::ConfirmationTimeout => "Confirmation Timeout",
            ErrorKind::Transport => "Transport",
            ErrorKind::MalformedRecord => "Malformed Record",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Classified failure of a session, read or submission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoanError {
    #[error("request rejected by user: {0}")]
    UserRejected(String),

    #[error("network mismatch: {0}")]
    NetworkMismatch(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("expired: {0}")]
    Expired(String),

    #[error("contract paused: {0}")]
    ContractPaused(String),

    #[error("contract reverted: {0}")]
    ContractReverted(String),

    #[error("no wallet session is connected")]
    NotConnected,

    #[error("{action} for loan {loan_id} is already in flight")]
    DuplicateSubmission { loan_id: LoanId, action: Action },

    #[error("gave up waiting for confirmation of {tx}; the transaction is still pending")]
    ConfirmationTimeout { tx: TxHash },

    #[error("ledger bridge unavailable: {0}")]
    Transport(String),

    #[error("malformed ledger record: {0}")]
    MalformedRecord(String),
}

impl LoanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoanError::UserRejected(_) => ErrorKind::UserRejected,
            LoanError::NetworkMismatch(_) => ErrorKind::NetworkMismatch,
            LoanError::InsufficientFunds(_) => ErrorKind::InsufficientFunds,
            LoanError::InvalidState(_) => ErrorKind::InvalidState,
            LoanError::Expired(_) => ErrorKind::Expired,
            LoanError::ContractPaused(_) => ErrorKind::ContractPaused,
            LoanError::ContractReverted(_) => ErrorKind::ContractReverted,
            LoanError::NotConnected => ErrorKind::NotConnected,
            LoanError::DuplicateSubmission { .. } => ErrorKind::DuplicateSubmission,
            LoanError::ConfirmationTimeout { .. } => ErrorKind::ConfirmationTimeout,
            LoanError::Transport(_) => ErrorKind::Transport,
            LoanError::MalformedRecord(_) => ErrorKind::MalformedRecord,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind().is_recoverable()
    }
}

/// An unclassified failure as reported by a wallet or the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RawFailure {
    pub code: Option<i64>,
    pub message: String,
}

const USER_REJECTED_MARKERS: &[&str] = &["user rejected", "user denied", "rejected by user"];
const NETWORK_MARKERS: &[&str] = &["unrecognized chain", "wrong network", "chain mismatch"];
const FUNDS_MARKERS: &[&str] = &["insufficient funds", "insufficient balance"];
const PAUSED_MARKERS: &[&str] = &["paused"];
const EXPIRED_MARKERS: &[&str] = &[
    "due date",
    "past due",
    "not due",
    "overdue",
    "expired",
    "too late",
    "too early",
];
const STATE_MARKERS: &[&str] = &[
    "invalid status",
    "invalid state",
    "not requested",
    "not funded",
    "not withdrawn",
    "already funded",
    "only borrower",
    "only the borrower",
    "cannot fund",
    "must send exact",
    "incorrect amount",
    "must exceed",
    "does not exist",
    "non-payable",
];

impl RawFailure {
    pub fn new(code: Option<i64>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn revert(reason: impl Into<String>) -> Self {
        Self::new(None, reason)
    }

    /// Maps the failure into the taxonomy, keeping the message verbatim.
    pub fn classify(self) -> LoanError {
        let lower = self.message.to_lowercase();
        let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

        if self.code == Some(CODE_USER_REJECTED) || has(USER_REJECTED_MARKERS) {
            LoanError::UserRejected(self.message)
        } else if self.code == Some(CODE_UNRECOGNIZED_CHAIN) || has(NETWORK_MARKERS) {
            LoanError::NetworkMismatch(self.message)
        } else if has(FUNDS_MARKERS) {
            LoanError::InsufficientFunds(self.message)
        } else if has(PAUSED_MARKERS) {
            LoanError::ContractPaused(self.message)
        } else if has(EXPIRED_MARKERS) {
            LoanError::Expired(self.message)
        } else if has(STATE_MARKERS) {
            LoanError::InvalidState(self.message)
        } else {
            LoanError::ContractReverted(self.message)
        }
    }
}

/// Failure talking to the wallet provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Rpc(RawFailure),

    #[error("wallet bridge unavailable: {0}")]
    Transport(String),
}

impl ProviderError {
    pub fn code(&self) -> Option<i64> {
        match self {
            ProviderError::Rpc(raw) => raw.code,
            ProviderError::Transport(_) => None,
        }
    }

    pub fn classify(self) -> LoanError {
        match self {
            ProviderError::Rpc(raw) => raw.classify(),
            ProviderError::Transport(message) => LoanError::Transport(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(code: Option<i64>, message: &str) -> ErrorKind {
        RawFailure::new(code, message).classify().kind()
    }

    #[test]
    fn wallet_codes_take_precedence_over_text() {
        assert_eq!(classify(Some(4001), "whatever"), ErrorKind::UserRejected);
        assert_eq!(classify(Some(4902), "Unknown chain"), ErrorKind::NetworkMismatch);
        assert_eq!(
            classify(None, "MetaMask Tx Signature: User denied transaction signature."),
            ErrorKind::UserRejected
        );
    }

    #[test]
    fn revert_reasons_map_to_kinds() {
        assert_eq!(
            classify(Some(-32000), "insufficient funds for gas * price + value"),
            ErrorKind::InsufficientFunds
        );
        assert_eq!(classify(None, "Pausable: paused"), ErrorKind::ContractPaused);
        assert_eq!(classify(None, "MicroLoan: loan past due"), ErrorKind::Expired);
        assert_eq!(classify(None, "MicroLoan: loan not past due"), ErrorKind::Expired);
        assert_eq!(classify(None, "MicroLoan: only borrower"), ErrorKind::InvalidState);
        assert_eq!(
            classify(None, "MicroLoan: must send exact principal"),
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn unknown_reasons_are_surfaced_verbatim() {
        let err = RawFailure::revert("execution reverted: 0x4e487b71").classify();
        assert_eq!(err.kind(), ErrorKind::ContractReverted);
        assert_eq!(err.to_string(), "contract reverted: execution reverted: 0x4e487b71");
    }

    #[test]
    fn structural_kinds_are_not_recoverable() {
        assert!(!ErrorKind::InvalidState.is_recoverable());
        assert!(!ErrorKind::Expired.is_recoverable());
        assert!(ErrorKind::UserRejected.is_recoverable());
        assert!(ErrorKind::ContractPaused.is_recoverable());
    }

    #[test]
    fn provider_transport_is_not_a_revert() {
        let err = ProviderError::Transport("connection refused".into()).classify();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
