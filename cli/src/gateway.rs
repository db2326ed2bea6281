//! Ledger Gateway
//!
//! Typed seam over the loan contract. Reads never mutate and may be retried.
//! Writes return as soon as the transaction is broadcast; confirmation is
//! observed separately through [`LedgerGateway::receipt`].

use crate::error::LoanError;
use crate::lifecycle::Loan;
use crate::types::{Address, Amount, LoanId, TxHash};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

/// Handle for a broadcast, not yet confirmed, transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTx {
    pub hash: TxHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptStatus {
    Confirmed,
    Reverted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub hash: TxHash,
    pub status: ReceiptStatus,
    pub block: u64,
    /// Set by the ledger for `requestLoan`.
    pub loan_id: Option<LoanId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LoanEventKind {
    Requested,
    Funded,
    Withdrawn,
    Repaid,
    Defaulted,
}

/// Notification emitted by the ledger after a transition is confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoanEvent {
    pub loan_id: LoanId,
    pub kind: LoanEventKind,
    pub block: u64,
}

#[async_trait]
pub trait LedgerGateway: Send + Sync {
    async fn get_loan(&self, loan_id: LoanId) -> Result<Loan, LoanError>;

    async fn get_borrower_loans(&self, borrower: Address) -> Result<Vec<LoanId>, LoanError>;

    async fn get_lender_loans(&self, lender: Address) -> Result<Vec<LoanId>, LoanError>;

    async fn get_requested_loans(&self) -> Result<Vec<LoanId>, LoanError>;

    async fn request_loan(
        &self,
        from: Address,
        principal: Amount,
        repayment: Amount,
        due_date: DateTime<Utc>,
    ) -> Result<PendingTx, LoanError>;

    async fn fund_loan(
        &self,
        from: Address,
        loan_id: LoanId,
        value: Amount,
    ) -> Result<PendingTx, LoanError>;

    async fn withdraw_to_borrower(
        &self,
        from: Address,
        loan_id: LoanId,
    ) -> Result<PendingTx, LoanError>;

    async fn repay_loan(
        &self,
        from: Address,
        loan_id: LoanId,
        value: Amount,
    ) -> Result<PendingTx, LoanError>;

    async fn mark_default(&self, from: Address, loan_id: LoanId) -> Result<PendingTx, LoanError>;

    /// `Ok(None)` while the transaction is still pending.
    async fn receipt(&self, tx: &TxHash) -> Result<Option<Receipt>, LoanError>;

    /// Live stream of loan notifications; ends when the ledger side hangs up.
    async fn loan_events(&self) -> Result<mpsc::Receiver<LoanEvent>, LoanError>;
}
