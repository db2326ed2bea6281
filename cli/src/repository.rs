//! Loan Repository
//!
//! Read-through cache of the loans relevant to one account. A cached set is
//! scoped to the session it was read under (account, chain and epoch) and is
//! never served across a session change. Refreshing always re-reads the whole
//! set and swaps it in one step.

use crate::error::LoanError;
use crate::gateway::{LedgerGateway, LoanEventKind};
use crate::lifecycle::{Loan, LoanStatus};
use crate::retry::RetryPolicy;
use crate::session::Session;
use crate::types::{Address, Amount, LoanId};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Every loan an account borrowed, lent, or could fund, as of one read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoanSet {
    account: Address,
    loans: BTreeMap<LoanId, Loan>,
    borrowed: Vec<LoanId>,
    lent: Vec<LoanId>,
    available: Vec<LoanId>,
}

impl LoanSet {
    pub fn account(&self) -> Address {
        self.account
    }

    pub fn get(&self, loan_id: LoanId) -> Option<&Loan> {
        self.loans.get(&loan_id)
    }

    pub fn contains(&self, loan_id: LoanId) -> bool {
        self.loans.contains_key(&loan_id)
    }

    pub fn len(&self) -> usize {
        self.loans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loans.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Loan> {
        self.loans.values()
    }

    /// Loans the account borrowed.
    pub fn borrowed(&self) -> impl Iterator<Item = &Loan> {
        self.select(&self.borrowed)
    }

    /// Loans the account funded.
    pub fn lent(&self) -> impl Iterator<Item = &Loan> {
        self.select(&self.lent)
    }

    /// Requested loans from other borrowers.
    pub fn available(&self) -> impl Iterator<Item = &Loan> {
        self.select(&self.available)
    }

    fn select<'a>(&'a self, ids: &'a [LoanId]) -> impl Iterator<Item = &'a Loan> + 'a {
        ids.iter().filter_map(|id| self.loans.get(id))
    }

    pub fn summary(&self) -> PortfolioSummary {
        PortfolioSummary::from_lent(self.lent())
    }
}

/// Figures for the lender dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioSummary {
    pub total_invested: Amount,
    /// Funded or withdrawn, not yet settled.
    pub active_investments: usize,
    /// Interest earned on repaid loans.
    pub total_returns: Amount,
    /// Mean interest rate across all funded loans, in percent.
    pub average_return_rate: f64,
}

impl PortfolioSummary {
    pub fn from_lent<'a>(loans: impl Iterator<Item = &'a Loan>) -> Self {
        let mut total_invested = Amount::ZERO;
        let mut total_returns = Amount::ZERO;
        let mut active_investments = 0;
        let mut rate_sum = 0.0;
        let mut count = 0usize;

        for loan in loans {
            total_invested = total_invested.checked_add(loan.principal).unwrap_or(total_invested);
            match loan.status {
                LoanStatus::Funded | LoanStatus::Withdrawn => active_investments += 1,
                LoanStatus::Repaid => {
                    total_returns = total_returns.checked_add(loan.interest()).unwrap_or(total_returns);
                }
                LoanStatus::Requested | LoanStatus::Defaulted => {}
            }
            rate_sum += loan.interest_rate() * 100.0;
            count += 1;
        }

        Self {
            total_invested,
            active_investments,
            total_returns,
            average_return_rate: if count == 0 { 0.0 } else { rate_sum / count as f64 },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Scope {
    account: Address,
    chain_id: u64,
    epoch: u64,
}

impl Scope {
    fn of(account: Address, session: &Session) -> Self {
        Self {
            account,
            chain_id: session.chain_id,
            epoch: session.epoch(),
        }
    }
}

struct Cached {
    scope: Scope,
    set: Arc<LoanSet>,
}

pub struct LoanRepository {
    gateway: Arc<dyn LedgerGateway>,
    session: watch::Receiver<Session>,
    retry: RetryPolicy,
    cache: RwLock<Option<Cached>>,
    // Serializes ledger reads so concurrent misses share one fetch.
    loading: Mutex<()>,
}

impl LoanRepository {
    pub fn new(
        gateway: Arc<dyn LedgerGateway>,
        session: watch::Receiver<Session>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            gateway,
            session,
            retry,
            cache: RwLock::new(None),
            loading: Mutex::new(()),
        }
    }

    fn session(&self) -> Session {
        self.session.borrow().clone()
    }

    fn active_account(&self) -> Result<Address, LoanError> {
        self.session().active_account().ok_or(LoanError::NotConnected)
    }

    /// The cached set for `account`, if one was read under the current session.
    pub async fn cached(&self) -> Option<Arc<LoanSet>> {
        let session = self.session();
        let account = session.active_account()?;
        self.lookup(Scope::of(account, &session)).await
    }

    async fn lookup(&self, scope: Scope) -> Option<Arc<LoanSet>> {
        let cache = self.cache.read().await;
        cache
            .as_ref()
            .filter(|cached| cached.scope == scope)
            .map(|cached| Arc::clone(&cached.set))
    }

    /// Loans for `account`, read from the ledger on first access in this session.
    pub async fn loans_for(&self, account: Address) -> Result<Arc<LoanSet>, LoanError> {
        let scope = Scope::of(account, &self.session());
        if let Some(set) = self.lookup(scope).await {
            return Ok(set);
        }

        let _loading = self.loading.lock().await;
        // Another caller may have filled it while we waited.
        if let Some(set) = self.lookup(scope).await {
            return Ok(set);
        }
        self.load(scope).await
    }

    /// Loans for the session's account.
    pub async fn loans(&self) -> Result<Arc<LoanSet>, LoanError> {
        let account = self.active_account()?;
        self.loans_for(account).await
    }

    /// Re-reads every loan for the session's account and replaces the cache.
    pub async fn refresh(&self) -> Result<Arc<LoanSet>, LoanError> {
        let account = self.active_account()?;
        let _loading = self.loading.lock().await;
        self.load(Scope::of(account, &self.session())).await
    }

    pub async fn invalidate(&self) {
        if self.cache.write().await.take().is_some() {
            debug!("loan cache invalidated");
        }
    }

    async fn load(&self, scope: Scope) -> Result<Arc<LoanSet>, LoanError> {
        let set = Arc::new(self.fetch(scope.account).await?);

        let current = self.session();
        if current.epoch() == scope.epoch && current.chain_id == scope.chain_id {
            *self.cache.write().await = Some(Cached {
                scope,
                set: Arc::clone(&set),
            });
        } else {
            debug!(
                read_under = scope.epoch,
                now = current.epoch(),
                "session changed during refresh, result not cached"
            );
        }
        Ok(set)
    }

    async fn fetch(&self, account: Address) -> Result<LoanSet, LoanError> {
        let gateway = &self.gateway;
        let borrowed = self
            .retry
            .read("borrower loans", || gateway.get_borrower_loans(account))
            .await?;
        let lent = self
            .retry
            .read("lender loans", || gateway.get_lender_loans(account))
            .await?;
        let requested = self
            .retry
            .read("requested loans", || gateway.get_requested_loans())
            .await?;

        let ids: BTreeSet<LoanId> = borrowed
            .iter()
            .chain(lent.iter())
            .chain(requested.iter())
            .copied()
            .collect();

        let mut loans = BTreeMap::new();
        for id in ids {
            let loan = self.retry.read("loan", || gateway.get_loan(id)).await?;
            loans.insert(id, loan);
        }

        let mut borrowed = sorted(borrowed);
        let mut lent = sorted(lent);
        borrowed.retain(|id| loans.get(id).is_some_and(|l| l.borrower == account));
        lent.retain(|id| loans.get(id).is_some_and(|l| l.lender == Some(account)));
        let available = sorted(requested)
            .into_iter()
            .filter(|id| {
                loans
                    .get(id)
                    .is_some_and(|l| l.status == LoanStatus::Requested && l.borrower != account)
            })
            .collect();

        debug!(
            account = %account,
            loans = loans.len(),
            borrowed = borrowed.len(),
            lent = lent.len(),
            "loan set refreshed"
        );

        Ok(LoanSet {
            account,
            loans,
            borrowed,
            lent,
            available,
        })
    }

    /// Drops the cache whenever a new session is published.
    pub fn watch_session(self: &Arc<Self>) -> JoinHandle<()> {
        let repo = Arc::clone(self);
        let mut sessions = self.session.clone();
        // Only sessions published after this point invalidate.
        sessions.borrow_and_update();
        tokio::spawn(async move {
            while sessions.changed().await.is_ok() {
                repo.invalidate().await;
            }
        })
    }

    /// Refreshes the cache when the ledger reports a change that touches it.
    ///
    /// New requests always trigger a refresh since they may appear in the
    /// available list.
    pub async fn watch_ledger(self: &Arc<Self>) -> Result<JoinHandle<()>, LoanError> {
        let mut events = self.gateway.loan_events().await?;
        let repo = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(cached) = repo.cached().await else {
                    continue;
                };
                if event.kind != LoanEventKind::Requested && !cached.contains(event.loan_id) {
                    continue;
                }
                debug!(loan_id = event.loan_id, kind = ?event.kind, "ledger event, refreshing");
                if let Err(err) = repo.refresh().await {
                    warn!(error = %err, kind = %err.kind(), "refresh after ledger event failed");
                }
            }
            debug!("ledger event stream closed");
        }))
    }
}

fn sorted(mut ids: Vec<LoanId>) -> Vec<LoanId> {
    ids.sort_unstable();
    ids.dedup();
    ids
}
