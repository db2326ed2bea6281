//! Wiring for a complete client: one session manager, one repository and one
//! coordinator sharing a gateway.

use crate::config::ClientConfig;
use crate::coordinator::{Confirmation, TransactionCoordinator};
use crate::error::LoanError;
use crate::gateway::LedgerGateway;
use crate::grpc::{self, GrpcLedger, GrpcWallet};
use crate::lifecycle::{self, Action, Loan, LoanRequest};
use crate::repository::{LoanRepository, LoanSet};
use crate::session::{Session, SessionManager, WalletProvider};
use crate::types::{Amount, Clock, LoanId, SystemClock};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

pub struct LoanClient {
    gateway: Arc<dyn LedgerGateway>,
    sessions: Arc<SessionManager>,
    repository: Arc<LoanRepository>,
    coordinator: TransactionCoordinator,
    clock: Arc<dyn Clock>,
}

impl LoanClient {
    pub fn new(
        config: &ClientConfig,
        gateway: Arc<dyn LedgerGateway>,
        wallet: Arc<dyn WalletProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(wallet, config.chain.clone()));
        let repository = Arc::new(LoanRepository::new(
            Arc::clone(&gateway),
            sessions.subscribe(),
            config.read_retry.clone(),
        ));
        let coordinator = TransactionCoordinator::new(
            Arc::clone(&gateway),
            Arc::clone(&repository),
            sessions.subscribe(),
            config.chain.chain_id,
            Arc::clone(&clock),
        )
        .with_poll_interval(config.poll_interval)
        .with_confirmation_timeout(config.confirmation_timeout);

        Self {
            gateway,
            sessions,
            repository,
            coordinator,
            clock,
        }
    }

    /// Connects to the gRPC bridge at `config.endpoint`.
    pub async fn connect_grpc(config: &ClientConfig) -> Result<Self, LoanError> {
        let channel = grpc::connect(config).await?;
        info!(endpoint = %config.endpoint, chain_id = config.chain.chain_id, "connected to bridge");
        Ok(Self::new(
            config,
            Arc::new(GrpcLedger::new(channel.clone())),
            Arc::new(GrpcWallet::new(channel)),
            Arc::new(SystemClock),
        ))
    }

    pub fn gateway(&self) -> &Arc<dyn LedgerGateway> {
        &self.gateway
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn repository(&self) -> &Arc<LoanRepository> {
        &self.repository
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn session(&self) -> Session {
        self.sessions.current_session()
    }

    pub async fn connect(&self) -> Result<Session, LoanError> {
        self.sessions.connect().await
    }

    /// Starts the background tasks that keep the session and cache current:
    /// wallet notifications, cache drop on session change, and ledger events.
    pub async fn start_watchers(&self) -> Result<Vec<JoinHandle<()>>, LoanError> {
        Ok(vec![
            self.sessions.watch_wallet().await?,
            self.repository.watch_session(),
            self.repository.watch_ledger().await?,
        ])
    }

    pub async fn loans(&self) -> Result<Arc<LoanSet>, LoanError> {
        self.repository.loans().await
    }

    pub async fn refresh(&self) -> Result<Arc<LoanSet>, LoanError> {
        self.repository.refresh().await
    }

    pub async fn submit(
        &self,
        action: Action,
        loan_id: LoanId,
        value: Option<Amount>,
    ) -> Result<Confirmation, LoanError> {
        self.coordinator.submit(action, loan_id, value).await
    }

    pub async fn request(&self, request: LoanRequest) -> Result<Confirmation, LoanError> {
        self.coordinator.request(request).await
    }

    /// Actions the session's account may take on `loan` right now.
    pub fn actions_for(&self, loan: &Loan) -> Vec<Action> {
        match self.session().active_account() {
            Some(account) => lifecycle::available_actions(loan, account, self.clock.now()),
            None => Vec::new(),
        }
    }
}
