//! In-memory ledger and wallet.
//!
//! [`MemoryLedger`] applies the loan contract's rules to records held in
//! process and answers through the same [`LedgerGateway`] trait as the gRPC
//! bridge. [`MemoryWallet`] plays the user's wallet. Both back the offline
//! demo and the test suites, and expose knobs for injecting the failures a
//! real ledger produces.

use crate::config::ChainParams;
use crate::error::{LoanError, ProviderError, RawFailure, CODE_UNRECOGNIZED_CHAIN, CODE_USER_REJECTED};
use crate::gateway::{LedgerGateway, LoanEvent, LoanEventKind, PendingTx, Receipt, ReceiptStatus};
use crate::lifecycle::{self, Loan, LoanStatus, RawLoanRecord, MAX_TERM_DAYS};
use crate::session::{WalletEvent, WalletProvider};
use crate::types::{Address, Amount, Clock, LoanId, TxHash};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone)]
struct StoredLoan {
    borrower: Address,
    lender: Address,
    principal: Amount,
    repayment: Amount,
    due_date: i64,
    status: LoanStatus,
}

/// A transaction that reached the ledger but is not yet in a block.
#[derive(Debug, Clone)]
struct Queued {
    hash: TxHash,
    from: Address,
    call: Call,
}

#[derive(Debug, Clone)]
enum Call {
    Request {
        principal: Amount,
        repayment: Amount,
        due_date: i64,
    },
    Fund(LoanId, Amount),
    Withdraw(LoanId),
    Repay(LoanId, Amount),
    MarkDefault(LoanId),
}

impl Call {
    fn value(&self) -> Amount {
        match self {
            Call::Fund(_, value) | Call::Repay(_, value) => *value,
            _ => Amount::ZERO,
        }
    }
}

#[derive(Default)]
struct LedgerState {
    loans: Vec<StoredLoan>,
    receipts: HashMap<TxHash, Receipt>,
    queued: Vec<Queued>,
    balances: HashMap<Address, Amount>,
    subscribers: Vec<mpsc::Sender<LoanEvent>>,
    next_tx: u64,
    block: u64,
    paused: bool,
    hold_blocks: bool,
    reject_next: Option<RawFailure>,
    outage_reads: usize,
    writes: usize,
    reads: usize,
}

pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    clock: Arc<dyn Clock>,
}

impl MemoryLedger {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            clock,
        }
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Caps what `account` can spend. Accounts without a balance are unlimited.
    pub fn set_balance(&self, account: Address, balance: Amount) {
        self.state().balances.insert(account, balance);
    }

    pub fn balance(&self, account: Address) -> Option<Amount> {
        self.state().balances.get(&account).copied()
    }

    pub fn set_paused(&self, paused: bool) {
        self.state().paused = paused;
    }

    /// Leaves broadcast transactions pending until [`MemoryLedger::mine`].
    pub fn hold_blocks(&self, hold: bool) {
        self.state().hold_blocks = hold;
    }

    /// Fails the next submission before it is broadcast.
    pub fn reject_next_submission(&self, failure: RawFailure) {
        self.state().reject_next = Some(failure);
    }

    /// Makes the next `count` reads fail as if the bridge were unreachable.
    pub fn fail_reads(&self, count: usize) {
        self.state().outage_reads = count;
    }

    pub fn write_count(&self) -> usize {
        self.state().writes
    }

    pub fn read_count(&self) -> usize {
        self.state().reads
    }

    pub fn pending_count(&self) -> usize {
        self.state().queued.len()
    }

    /// Includes every queued transaction in a new block.
    pub fn mine(&self) {
        let now = self.clock.now();
        let mut state = self.state();
        let queued = std::mem::take(&mut state.queued);
        if queued.is_empty() {
            return;
        }
        state.block += 1;
        for tx in queued {
            Self::execute(&mut state, tx, now);
        }
    }

    fn read(&self) -> Result<MutexGuard<'_, LedgerState>, LoanError> {
        let mut state = self.state();
        state.reads += 1;
        if state.outage_reads > 0 {
            state.outage_reads -= 1;
            return Err(LoanError::Transport("memory ledger offline".to_string()));
        }
        Ok(state)
    }

    fn broadcast(&self, from: Address, call: Call) -> Result<PendingTx, LoanError> {
        let now = self.clock.now();
        let mut state = self.state();
        if let Some(failure) = state.reject_next.take() {
            return Err(failure.classify());
        }

        let value = call.value();
        if let Some(balance) = state.balances.get(&from) {
            if *balance < value {
                return Err(RawFailure::new(
                    Some(-32000),
                    format!(
                        "insufficient funds for gas * price + value: have {} want {}",
                        balance, value
                    ),
                )
                .classify());
            }
        }

        state.writes += 1;
        state.next_tx += 1;
        let hash = TxHash::new(format!("0x{:064x}", state.next_tx));
        let tx = Queued {
            hash: hash.clone(),
            from,
            call,
        };
        if state.hold_blocks {
            state.queued.push(tx);
        } else {
            state.block += 1;
            Self::execute(&mut state, tx, now);
        }
        Ok(PendingTx { hash })
    }

    fn execute(state: &mut LedgerState, tx: Queued, now: DateTime<Utc>) {
        let block = state.block;
        let outcome = Self::apply(state, &tx, now.timestamp());
        let (status, loan_id) = match outcome {
            Ok((loan_id, kind)) => {
                if let Some(balance) = state.balances.get_mut(&tx.from) {
                    *balance = balance.saturating_sub(tx.call.value());
                }
                let event = LoanEvent {
                    loan_id,
                    kind,
                    block,
                };
                state
                    .subscribers
                    .retain(|sub| !sub.is_closed() && sub.try_send(event).is_ok());
                (ReceiptStatus::Confirmed, Some(loan_id))
            }
            Err(reason) => (ReceiptStatus::Reverted(reason), None),
        };
        state.receipts.insert(
            tx.hash.clone(),
            Receipt {
                hash: tx.hash,
                status,
                block,
                loan_id,
            },
        );
    }

    fn apply(
        state: &mut LedgerState,
        tx: &Queued,
        now: i64,
    ) -> Result<(LoanId, LoanEventKind), String> {
        if state.paused {
            return Err("Pausable: paused".to_string());
        }

        match tx.call {
            Call::Request {
                principal,
                repayment,
                due_date,
            } => {
                if repayment <= principal {
                    return Err("MicroLoan: repayment must exceed principal".to_string());
                }
                if due_date <= now {
                    return Err("MicroLoan: due date must be in the future".to_string());
                }
                if due_date > now + MAX_TERM_DAYS * 86_400 {
                    return Err("MicroLoan: due date too far in the future".to_string());
                }
                let id = state.loans.len() as LoanId;
                state.loans.push(StoredLoan {
                    borrower: tx.from,
                    lender: Address::ZERO,
                    principal,
                    repayment,
                    due_date,
                    status: LoanStatus::Requested,
                });
                Ok((id, LoanEventKind::Requested))
            }
            Call::Fund(id, value) => {
                let loan = Self::stored_mut(state, id)?;
                if loan.status != LoanStatus::Requested {
                    return Err("MicroLoan: loan not requested".to_string());
                }
                if tx.from == loan.borrower {
                    return Err("MicroLoan: borrower cannot fund own loan".to_string());
                }
                if value != loan.principal {
                    return Err("MicroLoan: must send exact principal".to_string());
                }
                loan.lender = tx.from;
                loan.status = LoanStatus::Funded;
                Ok((id, LoanEventKind::Funded))
            }
            Call::Withdraw(id) => {
                let loan = Self::stored_mut(state, id)?;
                if tx.from != loan.borrower {
                    return Err("MicroLoan: only borrower".to_string());
                }
                if loan.status != LoanStatus::Funded {
                    return Err("MicroLoan: loan not funded".to_string());
                }
                loan.status = LoanStatus::Withdrawn;
                Ok((id, LoanEventKind::Withdrawn))
            }
            Call::Repay(id, value) => {
                let loan = Self::stored_mut(state, id)?;
                if tx.from != loan.borrower {
                    return Err("MicroLoan: only borrower".to_string());
                }
                if loan.status != LoanStatus::Withdrawn {
                    return Err("MicroLoan: loan not withdrawn".to_string());
                }
                if value != loan.repayment {
                    return Err("MicroLoan: must send exact repayment".to_string());
                }
                if now > loan.due_date {
                    return Err("MicroLoan: loan past due".to_string());
                }
                loan.status = LoanStatus::Repaid;
                Ok((id, LoanEventKind::Repaid))
            }
            Call::MarkDefault(id) => {
                let loan = Self::stored_mut(state, id)?;
                if loan.status != LoanStatus::Withdrawn {
                    return Err("MicroLoan: loan not withdrawn".to_string());
                }
                if now <= loan.due_date {
                    return Err("MicroLoan: loan not past due".to_string());
                }
                loan.status = LoanStatus::Defaulted;
                Ok((id, LoanEventKind::Defaulted))
            }
        }
    }

    fn stored_mut(state: &mut LedgerState, id: LoanId) -> Result<&mut StoredLoan, String> {
        state
            .loans
            .get_mut(id as usize)
            .ok_or_else(|| "MicroLoan: loan does not exist".to_string())
    }

    fn ids_where(state: &LedgerState, pred: impl Fn(&StoredLoan) -> bool) -> Vec<LoanId> {
        state
            .loans
            .iter()
            .enumerate()
            .filter(|(_, loan)| pred(loan))
            .map(|(id, _)| id as LoanId)
            .collect()
    }
}

#[async_trait]
impl LedgerGateway for MemoryLedger {
    async fn get_loan(&self, loan_id: LoanId) -> Result<Loan, LoanError> {
        let state = self.read()?;
        let stored = state.loans.get(loan_id as usize).ok_or_else(|| {
            RawFailure::revert(format!("MicroLoan: loan {} does not exist", loan_id)).classify()
        })?;
        lifecycle::normalize(RawLoanRecord {
            id: loan_id,
            borrower: stored.borrower.to_string(),
            lender: stored.lender.to_string(),
            principal: stored.principal.to_string(),
            repayment: stored.repayment.to_string(),
            due_date: stored.due_date,
            status: stored.status.code(),
        })
    }

    async fn get_borrower_loans(&self, borrower: Address) -> Result<Vec<LoanId>, LoanError> {
        let state = self.read()?;
        Ok(Self::ids_where(&state, |loan| loan.borrower == borrower))
    }

    async fn get_lender_loans(&self, lender: Address) -> Result<Vec<LoanId>, LoanError> {
        let state = self.read()?;
        Ok(Self::ids_where(&state, |loan| {
            !lender.is_zero() && loan.lender == lender
        }))
    }

    async fn get_requested_loans(&self) -> Result<Vec<LoanId>, LoanError> {
        let state = self.read()?;
        Ok(Self::ids_where(&state, |loan| loan.status == LoanStatus::Requested))
    }

    async fn request_loan(
        &self,
        from: Address,
        principal: Amount,
        repayment: Amount,
        due_date: DateTime<Utc>,
    ) -> Result<PendingTx, LoanError> {
        self.broadcast(
            from,
            Call::Request {
                principal,
                repayment,
                due_date: due_date.timestamp(),
            },
        )
    }

    async fn fund_loan(
        &self,
        from: Address,
        loan_id: LoanId,
        value: Amount,
    ) -> Result<PendingTx, LoanError> {
        self.broadcast(from, Call::Fund(loan_id, value))
    }

    async fn withdraw_to_borrower(
        &self,
        from: Address,
        loan_id: LoanId,
    ) -> Result<PendingTx, LoanError> {
        self.broadcast(from, Call::Withdraw(loan_id))
    }

    async fn repay_loan(
        &self,
        from: Address,
        loan_id: LoanId,
        value: Amount,
    ) -> Result<PendingTx, LoanError> {
        self.broadcast(from, Call::Repay(loan_id, value))
    }

    async fn mark_default(&self, from: Address, loan_id: LoanId) -> Result<PendingTx, LoanError> {
        self.broadcast(from, Call::MarkDefault(loan_id))
    }

    async fn receipt(&self, tx: &TxHash) -> Result<Option<Receipt>, LoanError> {
        let state = self.read()?;
        Ok(state.receipts.get(tx).cloned())
    }

    async fn loan_events(&self) -> Result<mpsc::Receiver<LoanEvent>, LoanError> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.state().subscribers.push(tx);
        Ok(rx)
    }
}

struct WalletState {
    accounts: Vec<Address>,
    chain_id: u64,
    known_chains: HashSet<u64>,
    user_approves: bool,
    network_prompts_approved: bool,
    added_chains: usize,
    subscribers: Vec<mpsc::Sender<WalletEvent>>,
}

/// Scripted stand-in for a browser wallet.
pub struct MemoryWallet {
    state: Mutex<WalletState>,
}

impl MemoryWallet {
    pub fn new(accounts: Vec<Address>, chain_id: u64) -> Self {
        Self {
            state: Mutex::new(WalletState {
                accounts,
                chain_id,
                known_chains: HashSet::from([chain_id]),
                user_approves: true,
                network_prompts_approved: true,
                added_chains: 0,
                subscribers: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, WalletState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_user_approves(&self, approves: bool) {
        self.state().user_approves = approves;
    }

    pub fn set_network_prompts_approved(&self, approved: bool) {
        self.state().network_prompts_approved = approved;
    }

    pub fn add_known_chain(&self, chain_id: u64) {
        self.state().known_chains.insert(chain_id);
    }

    pub fn added_chains(&self) -> usize {
        self.state().added_chains
    }

    /// The user picks a different account in the wallet UI.
    pub fn select_account(&self, account: Address) {
        let mut state = self.state();
        state.accounts.retain(|a| *a != account);
        state.accounts.insert(0, account);
        let accounts = state.accounts.clone();
        Self::notify(&mut state, WalletEvent::AccountsChanged(accounts));
    }

    /// The user switches network from the wallet UI.
    pub fn select_chain(&self, chain_id: u64) {
        let mut state = self.state();
        state.known_chains.insert(chain_id);
        state.chain_id = chain_id;
        Self::notify(&mut state, WalletEvent::ChainChanged(chain_id));
    }

    pub fn lock(&self) {
        let mut state = self.state();
        Self::notify(&mut state, WalletEvent::AccountsChanged(Vec::new()));
    }

    fn notify(state: &mut WalletState, event: WalletEvent) {
        state
            .subscribers
            .retain(|sub| !sub.is_closed() && sub.try_send(event.clone()).is_ok());
    }

    fn rejected() -> ProviderError {
        ProviderError::Rpc(RawFailure::new(
            Some(CODE_USER_REJECTED),
            "User rejected the request.",
        ))
    }
}

#[async_trait]
impl WalletProvider for MemoryWallet {
    async fn request_accounts(&self) -> Result<Vec<Address>, ProviderError> {
        let state = self.state();
        if !state.user_approves {
            return Err(Self::rejected());
        }
        Ok(state.accounts.clone())
    }

    async fn chain_id(&self) -> Result<u64, ProviderError> {
        Ok(self.state().chain_id)
    }

    async fn switch_chain(&self, chain: &ChainParams) -> Result<(), ProviderError> {
        let mut state = self.state();
        if !state.known_chains.contains(&chain.chain_id) {
            return Err(ProviderError::Rpc(RawFailure::new(
                Some(CODE_UNRECOGNIZED_CHAIN),
                format!("Unrecognized chain ID \"{}\".", chain.chain_id_hex()),
            )));
        }
        if !state.network_prompts_approved {
            return Err(Self::rejected());
        }
        state.chain_id = chain.chain_id;
        Ok(())
    }

    async fn add_chain(&self, chain: &ChainParams) -> Result<(), ProviderError> {
        let mut state = self.state();
        if !state.network_prompts_approved {
            return Err(Self::rejected());
        }
        state.known_chains.insert(chain.chain_id);
        state.chain_id = chain.chain_id;
        state.added_chains += 1;
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<WalletEvent>, ProviderError> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.state().subscribers.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ManualClock;

    fn addr(n: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[0] = n;
        Address::from_bytes(bytes)
    }

    fn ledger() -> (MemoryLedger, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        (MemoryLedger::new(clock.clone()), clock)
    }

    #[tokio::test]
    async fn reverted_calls_leave_a_receipt_and_no_state_change() {
        let (ledger, clock) = ledger();
        let due = clock.now() + chrono::Duration::days(30);
        let tx = ledger
            .request_loan(addr(1), Amount::from_base_units(100), Amount::from_base_units(110), due)
            .await
            .unwrap();
        let receipt = ledger.receipt(&tx.hash).await.unwrap().unwrap();
        assert_eq!(receipt.loan_id, Some(0));

        let tx = ledger
            .fund_loan(addr(2), 0, Amount::from_base_units(99))
            .await
            .unwrap();
        let receipt = ledger.receipt(&tx.hash).await.unwrap().unwrap();
        assert_eq!(
            receipt.status,
            ReceiptStatus::Reverted("MicroLoan: must send exact principal".to_string())
        );
        assert_eq!(ledger.get_loan(0).await.unwrap().status, LoanStatus::Requested);
    }

    #[tokio::test]
    async fn held_blocks_stay_pending_until_mined() {
        let (ledger, clock) = ledger();
        ledger.hold_blocks(true);
        let due = clock.now() + chrono::Duration::days(1);
        let tx = ledger
            .request_loan(addr(1), Amount::from_base_units(1), Amount::from_base_units(2), due)
            .await
            .unwrap();
        assert_eq!(ledger.receipt(&tx.hash).await.unwrap(), None);
        assert_eq!(ledger.pending_count(), 1);
        ledger.mine();
        assert!(ledger.receipt(&tx.hash).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn underfunded_sender_is_refused_before_broadcast() {
        let (ledger, _) = ledger();
        ledger.set_balance(addr(2), Amount::from_base_units(10));
        let err = ledger
            .fund_loan(addr(2), 0, Amount::from_base_units(11))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InsufficientFunds);
        assert_eq!(ledger.write_count(), 0);
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let (ledger, clock) = ledger();
        let mut events = ledger.loan_events().await.unwrap();
        let due = clock.now() + chrono::Duration::days(1);
        ledger
            .request_loan(addr(1), Amount::from_base_units(1), Amount::from_base_units(2), due)
            .await
            .unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, LoanEventKind::Requested);
        assert_eq!(event.loan_id, 0);
    }
}
