//! Transaction Coordinator
//!
//! Runs a loan action end to end: local guard check, ledger write,
//! confirmation wait, cache refresh. Each step is one await. Nothing in the
//! cache changes unless the ledger confirmed the transaction.

use crate::error::{ErrorKind, LoanError, RawFailure};
use crate::gateway::{LedgerGateway, PendingTx, Receipt, ReceiptStatus};
use crate::lifecycle::{self, Action, LoanRequest};
use crate::repository::{LoanRepository, LoanSet};
use crate::session::Session;
use crate::types::{Address, Amount, Clock, LoanId, TxHash};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Outcome of a confirmed submission.
#[derive(Debug, Clone)]
pub struct Confirmation {
    pub tx: TxHash,
    pub block: u64,
    pub loan_id: LoanId,
    /// The refreshed loan set, or `None` if the refresh after confirmation
    /// failed and the cache was dropped instead.
    pub loans: Option<Arc<LoanSet>>,
}

type InFlight = Arc<Mutex<HashSet<(LoanId, Action)>>>;

/// Releases an in-flight slot when the submission finishes or is dropped.
struct InFlightGuard {
    slots: InFlight,
    key: (LoanId, Action),
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(&self.key);
    }
}

pub struct TransactionCoordinator {
    gateway: Arc<dyn LedgerGateway>,
    repository: Arc<LoanRepository>,
    session: watch::Receiver<Session>,
    expected_chain: u64,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    confirmation_timeout: Option<Duration>,
    in_flight: InFlight,
}

impl TransactionCoordinator {
    pub fn new(
        gateway: Arc<dyn LedgerGateway>,
        repository: Arc<LoanRepository>,
        session: watch::Receiver<Session>,
        expected_chain: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            gateway,
            repository,
            session,
            expected_chain,
            clock,
            poll_interval: Duration::from_secs(2),
            confirmation_timeout: None,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_confirmation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    fn actor(&self) -> Result<Address, LoanError> {
        let session = self.session.borrow().clone();
        let account = session.active_account().ok_or(LoanError::NotConnected)?;
        if session.chain_id != self.expected_chain {
            return Err(LoanError::NetworkMismatch(format!(
                "session is on chain {}, expected {}",
                session.chain_id, self.expected_chain
            )));
        }
        Ok(account)
    }

    fn claim(&self, loan_id: LoanId, action: Action) -> Result<InFlightGuard, LoanError> {
        let key = (loan_id, action);
        let mut slots = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !slots.insert(key) {
            return Err(LoanError::DuplicateSubmission { loan_id, action });
        }
        Ok(InFlightGuard {
            slots: Arc::clone(&self.in_flight),
            key,
        })
    }

    /// Performs `action` on `loan_id` and waits for the ledger to confirm it.
    ///
    /// `value` is what the actor sends with payable actions. When `None`, the
    /// amount the ledger requires is sent.
    pub async fn submit(
        &self,
        action: Action,
        loan_id: LoanId,
        value: Option<Amount>,
    ) -> Result<Confirmation, LoanError> {
        let actor = self.actor()?;
        let _slot = self.claim(loan_id, action)?;

        let loan = match self.repository.cached().await.and_then(|set| set.get(loan_id).cloned()) {
            Some(loan) => loan,
            None => self.gateway.get_loan(loan_id).await?,
        };
        let value = if action.is_payable() {
            value.or(loan.required_value(action))
        } else {
            value
        };

        if let Err(err) = lifecycle::check_transition(&loan, action, actor, self.clock.now(), value) {
            debug!(loan_id, %action, error = %err, "rejected locally");
            return Err(err);
        }

        let sent = value.unwrap_or(Amount::ZERO);
        info!(loan_id, %action, actor = %actor, value = %sent, "submitting");
        let pending = match action {
            Action::Fund => self.gateway.fund_loan(actor, loan_id, sent).await,
            Action::Withdraw => self.gateway.withdraw_to_borrower(actor, loan_id).await,
            Action::Repay => self.gateway.repay_loan(actor, loan_id, sent).await,
            Action::MarkDefault => self.gateway.mark_default(actor, loan_id).await,
        }
        .map_err(|err| self.failed(action, loan_id, err))?;

        let receipt = self
            .await_confirmation(&pending)
            .await
            .map_err(|err| self.failed(action, loan_id, err))?;
        Ok(self.settle(receipt, loan_id).await)
    }

    /// Submits a new loan request and waits for the ledger to assign its id.
    pub async fn request(&self, request: LoanRequest) -> Result<Confirmation, LoanError> {
        let actor = self.actor()?;
        lifecycle::validate_request(&request, self.clock.now())?;

        info!(
            actor = %actor,
            principal = %request.principal,
            repayment = %request.repayment,
            due = %request.due_date,
            "requesting loan"
        );
        let pending = self
            .gateway
            .request_loan(actor, request.principal, request.repayment, request.due_date)
            .await
            .map_err(|err| self.request_failed(err))?;
        let receipt = self
            .await_confirmation(&pending)
            .await
            .map_err(|err| self.request_failed(err))?;
        let loan_id = receipt.loan_id.ok_or_else(|| {
            LoanError::MalformedRecord(format!("receipt {} carries no loan id", receipt.hash))
        })?;
        Ok(self.settle(receipt, loan_id).await)
    }

    fn failed(&self, action: Action, loan_id: LoanId, err: LoanError) -> LoanError {
        warn!(loan_id, %action, kind = %err.kind(), error = %err, "submission failed");
        err
    }

    fn request_failed(&self, err: LoanError) -> LoanError {
        warn!(kind = %err.kind(), error = %err, "loan request failed");
        err
    }

    /// Polls for the receipt of `pending` until it lands in a block.
    ///
    /// Transport failures while polling count as still pending. A revert is
    /// classified from the ledger's reason string.
    pub async fn await_confirmation(&self, pending: &PendingTx) -> Result<Receipt, LoanError> {
        let wait = self.poll_receipt(&pending.hash);
        let receipt = match self.confirmation_timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| LoanError::ConfirmationTimeout {
                    tx: pending.hash.clone(),
                })??,
            None => wait.await?,
        };

        if let ReceiptStatus::Reverted(reason) = &receipt.status {
            return Err(RawFailure::revert(reason.clone()).classify());
        }
        Ok(receipt)
    }

    async fn poll_receipt(&self, tx: &TxHash) -> Result<Receipt, LoanError> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            match self.gateway.receipt(tx).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => debug!(%tx, "pending"),
                Err(err) if err.kind() == ErrorKind::Transport => {
                    debug!(%tx, error = %err, "receipt poll failed, still pending");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn settle(&self, receipt: Receipt, loan_id: LoanId) -> Confirmation {
        info!(tx = %receipt.hash, block = receipt.block, loan_id, "confirmed");
        let loans = match self.repository.refresh().await {
            Ok(set) => Some(set),
            Err(err) => {
                warn!(error = %err, "refresh after confirmation failed, dropping cache");
                self.repository.invalidate().await;
                None
            }
        };
        Confirmation {
            tx: receipt.hash,
            block: receipt.block,
            loan_id,
            loans,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainParams;
    use crate::lifecycle::LoanStatus;
    use crate::memory::{MemoryLedger, MemoryWallet};
    use crate::retry::RetryPolicy;
    use crate::session::SessionManager;
    use crate::types::ManualClock;
    use chrono::DateTime;

    fn addr(n: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[0] = n;
        Address::from_bytes(bytes)
    }

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        sessions: SessionManager,
        coordinator: TransactionCoordinator,
        clock: Arc<ManualClock>,
    }

    async fn fixture(account: Address) -> Fixture {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        let ledger = Arc::new(MemoryLedger::new(clock.clone()));
        let chain = ChainParams::sepolia();
        let wallet = Arc::new(MemoryWallet::new(vec![account], chain.chain_id));
        let sessions = SessionManager::new(wallet, chain.clone());
        sessions.connect().await.unwrap();
        let repository = Arc::new(LoanRepository::new(
            ledger.clone(),
            sessions.subscribe(),
            RetryPolicy::none(),
        ));
        let coordinator = TransactionCoordinator::new(
            ledger.clone(),
            repository,
            sessions.subscribe(),
            chain.chain_id,
            clock.clone(),
        )
        .with_poll_interval(Duration::from_millis(10));
        Fixture {
            ledger,
            sessions,
            coordinator,
            clock,
        }
    }

    async fn requested_by(f: &Fixture, borrower: Address) -> LoanId {
        let due = f.clock.now() + chrono::Duration::days(30);
        let tx = f
            .ledger
            .request_loan(borrower, Amount::from_base_units(5000), Amount::from_base_units(5500), due)
            .await
            .unwrap();
        f.ledger.receipt(&tx.hash).await.unwrap().unwrap().loan_id.unwrap()
    }

    #[tokio::test]
    async fn local_rejection_never_reaches_ledger() {
        let f = fixture(addr(1)).await;
        let id = requested_by(&f, addr(1)).await;
        let writes = f.ledger.write_count();

        let err = f.coordinator.submit(Action::Fund, id, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let err = f.coordinator.submit(Action::Withdraw, id, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(f.ledger.write_count(), writes);
    }

    #[tokio::test]
    async fn confirmed_fund_refreshes_cache() {
        let f = fixture(addr(2)).await;
        let id = requested_by(&f, addr(1)).await;

        let done = f.coordinator.submit(Action::Fund, id, None).await.unwrap();
        let loans = done.loans.unwrap();
        let loan = loans.get(id).unwrap();
        assert_eq!(loan.status, LoanStatus::Funded);
        assert_eq!(loan.lender, Some(addr(2)));
    }

    #[tokio::test]
    async fn user_rejection_leaves_cache_untouched() {
        let f = fixture(addr(2)).await;
        let id = requested_by(&f, addr(1)).await;
        let before = f.coordinator.repository.loans().await.unwrap();

        f.ledger
            .reject_next_submission(RawFailure::new(Some(4001), "User denied transaction signature"));
        let err = f.coordinator.submit(Action::Fund, id, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UserRejected);

        let after = f.coordinator.repository.cached().await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn ledger_revert_is_classified() {
        let f = fixture(addr(2)).await;
        let id = requested_by(&f, addr(1)).await;
        f.ledger.set_paused(true);

        let err = f.coordinator.submit(Action::Fund, id, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContractPaused);
        assert_eq!(f.ledger.get_loan(id).await.unwrap().status, LoanStatus::Requested);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_submission_rejected_while_pending() {
        let f = fixture(addr(2)).await;
        let id = requested_by(&f, addr(1)).await;
        f.ledger.hold_blocks(true);

        let first = f.coordinator.submit(Action::Fund, id, None);
        tokio::pin!(first);
        // Drive the first submission up to its confirmation wait.
        tokio::select! {
            _ = &mut first => panic!("confirmed without a block"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
        assert_eq!(f.ledger.pending_count(), 1);

        let err = f.coordinator.submit(Action::Fund, id, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateSubmission);

        f.ledger.mine();
        let done = first.await.unwrap();
        assert_eq!(done.loan_id, id);
        assert_eq!(f.ledger.write_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_wait_gives_up() {
        let mut f = fixture(addr(2)).await;
        f.coordinator = f
            .coordinator
            .with_confirmation_timeout(Some(Duration::from_millis(100)));
        let id = requested_by(&f, addr(1)).await;
        f.ledger.hold_blocks(true);

        let err = f.coordinator.submit(Action::Fund, id, None).await.unwrap_err();
        assert!(matches!(err, LoanError::ConfirmationTimeout { .. }));
        assert_eq!(f.ledger.pending_count(), 1);

        // The slot is released, the transaction is not.
        f.ledger.mine();
        assert_eq!(f.ledger.get_loan(id).await.unwrap().status, LoanStatus::Funded);
    }

    #[tokio::test]
    async fn request_reports_assigned_id() {
        let f = fixture(addr(1)).await;
        let request = LoanRequest {
            principal: Amount::from_base_units(5000),
            repayment: Amount::from_base_units(5500),
            due_date: f.clock.now() + chrono::Duration::days(30),
        };
        let done = f.coordinator.request(request).await.unwrap();
        let loans = done.loans.unwrap();
        let loan = loans.get(done.loan_id).unwrap();
        assert_eq!(loan.status, LoanStatus::Requested);
        assert_eq!(loan.lender, None);
    }

    #[tokio::test]
    async fn submissions_need_a_session() {
        let f = fixture(addr(1)).await;
        f.sessions.disconnect();
        let err = f.coordinator.submit(Action::Withdraw, 0, None).await.unwrap_err();
        assert_eq!(err, LoanError::NotConnected);
    }
}
