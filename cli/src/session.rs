//! Wallet Session
//!
//! [`SessionManager`] owns the wallet connection and the expected chain. The
//! current [`Session`] is published on a `watch` channel; every new value,
//! including a reconnect of the same account, carries a fresh epoch and must
//! be treated as invalidating any loan data read under the previous one.

use crate::config::ChainParams;
use crate::error::{LoanError, ProviderError, CODE_UNRECOGNIZED_CHAIN};
use crate::types::Address;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Notification pushed by the wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    AccountsChanged(Vec<Address>),
    ChainChanged(u64),
    Disconnected,
}

/// Wallet/provider surface the session manager consumes.
#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// Prompts the user for account access.
    async fn request_accounts(&self) -> Result<Vec<Address>, ProviderError>;

    async fn chain_id(&self) -> Result<u64, ProviderError>;

    async fn switch_chain(&self, chain: &ChainParams) -> Result<(), ProviderError>;

    async fn add_chain(&self, chain: &ChainParams) -> Result<(), ProviderError>;

    async fn subscribe(&self) -> Result<mpsc::Receiver<WalletEvent>, ProviderError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub account: Option<Address>,
    pub chain_id: u64,
    pub connected: bool,
    epoch: u64,
}

impl Session {
    pub fn disconnected(chain_id: u64) -> Self {
        Self {
            account: None,
            chain_id,
            connected: false,
            epoch: 0,
        }
    }

    /// Monotonic counter distinguishing successive sessions.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The connected account, if any.
    pub fn active_account(&self) -> Option<Address> {
        self.account.filter(|_| self.connected)
    }
}

pub struct SessionManager {
    wallet: Arc<dyn WalletProvider>,
    expected: ChainParams,
    sender: watch::Sender<Session>,
    epoch: AtomicU64,
}

impl SessionManager {
    pub fn new(wallet: Arc<dyn WalletProvider>, expected: ChainParams) -> Self {
        let (sender, _) = watch::channel(Session::disconnected(expected.chain_id));
        Self {
            wallet,
            expected,
            sender,
            epoch: AtomicU64::new(0),
        }
    }

    pub fn expected_chain(&self) -> &ChainParams {
        &self.expected
    }

    pub fn current_session(&self) -> Session {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.sender.subscribe()
    }

    /// Requests account access and makes sure the wallet is on the expected
    /// chain, switching or adding it when needed.
    pub async fn connect(&self) -> Result<Session, LoanError> {
        let accounts = self
            .wallet
            .request_accounts()
            .await
            .map_err(ProviderError::classify)?;
        let account = accounts.first().copied().ok_or(LoanError::NotConnected)?;

        let chain_id = self.ensure_chain().await?;
        let session = self.publish(Some(account), chain_id, true);
        info!(account = %account, chain_id, epoch = session.epoch, "wallet session established");
        Ok(session)
    }

    pub fn disconnect(&self) -> Session {
        let chain_id = self.current_session().chain_id;
        let session = self.publish(None, chain_id, false);
        info!(epoch = session.epoch, "wallet session closed");
        session
    }

    async fn ensure_chain(&self) -> Result<u64, LoanError> {
        let expected = self.expected.chain_id;
        let current = self.wallet.chain_id().await.map_err(ProviderError::classify)?;
        if current == expected {
            return Ok(current);
        }

        info!(current, expected, "wallet on wrong chain, requesting switch");
        match self.wallet.switch_chain(&self.expected).await {
            Ok(()) => {}
            Err(err) if err.code() == Some(CODE_UNRECOGNIZED_CHAIN) => {
                info!(chain = %self.expected.chain_name, "chain unknown to wallet, requesting add");
                self.wallet
                    .add_chain(&self.expected)
                    .await
                    .map_err(|e| self.declined("add", e))?;
            }
            Err(err) => return Err(self.declined("switch", err)),
        }

        let now_on = self.wallet.chain_id().await.map_err(ProviderError::classify)?;
        if now_on != expected {
            return Err(LoanError::NetworkMismatch(format!(
                "wallet is on chain {} after switch, expected {}",
                now_on, expected
            )));
        }
        Ok(now_on)
    }

    fn declined(&self, what: &str, err: ProviderError) -> LoanError {
        match err {
            ProviderError::Transport(message) => LoanError::Transport(message),
            ProviderError::Rpc(raw) => LoanError::NetworkMismatch(format!(
                "could not {} to {} (chain {}): {}",
                what, self.expected.chain_name, self.expected.chain_id, raw.message
            )),
        }
    }

    fn publish(&self, account: Option<Address>, chain_id: u64, connected: bool) -> Session {
        let session = Session {
            account,
            chain_id,
            connected,
            epoch: self.epoch.fetch_add(1, Ordering::SeqCst) + 1,
        };
        self.sender.send_replace(session.clone());
        session
    }

    /// Applies a wallet notification and returns the resulting session.
    ///
    /// An account switch on the expected chain yields a new connected session
    /// for the first account. A switch to a different chain always tears the
    /// session down; a notification naming the current chain changes nothing.
    pub fn handle_event(&self, event: WalletEvent) -> Session {
        let current = self.current_session();
        match event {
            WalletEvent::AccountsChanged(accounts) => match accounts.first().copied() {
                None => {
                    info!("wallet locked or all accounts removed");
                    self.publish(None, current.chain_id, false)
                }
                Some(account) if current.active_account() == Some(account) => current,
                Some(account) if current.connected && current.chain_id == self.expected.chain_id => {
                    info!(from = ?current.account, to = %account, "active account changed");
                    self.publish(Some(account), current.chain_id, true)
                }
                Some(account) => {
                    debug!(account = %account, "account change ignored without a session");
                    current
                }
            },
            WalletEvent::ChainChanged(chain_id) => {
                if chain_id == current.chain_id {
                    debug!(chain_id, "chain notification for current chain");
                    return current;
                }
                warn!(from = current.chain_id, to = chain_id, "chain changed, session reset");
                self.publish(None, chain_id, false)
            }
            WalletEvent::Disconnected => {
                if !current.connected {
                    return current;
                }
                info!("wallet disconnected");
                self.publish(None, current.chain_id, false)
            }
        }
    }

    /// Subscribes to wallet notifications and applies them until the wallet
    /// side closes the stream.
    pub async fn watch_wallet(self: &Arc<Self>) -> Result<JoinHandle<()>, LoanError> {
        let mut events = self.wallet.subscribe().await.map_err(ProviderError::classify)?;
        let manager = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                manager.handle_event(event);
            }
            debug!("wallet event stream closed");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryWallet;

    fn addr(n: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[0] = n;
        Address::from_bytes(bytes)
    }

    fn manager(wallet: Arc<MemoryWallet>) -> SessionManager {
        SessionManager::new(wallet, ChainParams::sepolia())
    }

    #[tokio::test]
    async fn connect_on_expected_chain() {
        let wallet = Arc::new(MemoryWallet::new(vec![addr(1)], ChainParams::sepolia().chain_id));
        let sessions = manager(wallet);
        let session = sessions.connect().await.unwrap();
        assert_eq!(session.active_account(), Some(addr(1)));
        assert_eq!(sessions.current_session(), session);
    }

    #[tokio::test]
    async fn connect_switches_known_chain() {
        let wallet = Arc::new(MemoryWallet::new(vec![addr(1)], 1));
        wallet.add_known_chain(ChainParams::sepolia().chain_id);
        let sessions = manager(wallet.clone());
        let session = sessions.connect().await.unwrap();
        assert_eq!(session.chain_id, ChainParams::sepolia().chain_id);
        assert_eq!(wallet.added_chains(), 0);
    }

    #[tokio::test]
    async fn connect_adds_unknown_chain() {
        let wallet = Arc::new(MemoryWallet::new(vec![addr(1)], 1));
        let sessions = manager(wallet.clone());
        let session = sessions.connect().await.unwrap();
        assert!(session.connected);
        assert_eq!(wallet.added_chains(), 1);
    }

    #[tokio::test]
    async fn declined_switch_is_network_mismatch() {
        let wallet = Arc::new(MemoryWallet::new(vec![addr(1)], 1));
        wallet.set_network_prompts_approved(false);
        let sessions = manager(wallet);
        let err = sessions.connect().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NetworkMismatch);
        assert!(!sessions.current_session().connected);
    }

    #[tokio::test]
    async fn declined_account_request_is_user_rejected() {
        let wallet = Arc::new(MemoryWallet::new(vec![addr(1)], ChainParams::sepolia().chain_id));
        wallet.set_user_approves(false);
        let err = manager(wallet).connect().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UserRejected);
    }

    #[tokio::test]
    async fn account_and_chain_changes_republish() {
        let wallet = Arc::new(MemoryWallet::new(vec![addr(1)], ChainParams::sepolia().chain_id));
        let sessions = manager(wallet);
        let first = sessions.connect().await.unwrap();
        let mut rx = sessions.subscribe();

        let same = sessions.handle_event(WalletEvent::AccountsChanged(vec![addr(1)]));
        assert_eq!(same.epoch(), first.epoch());

        let switched = sessions.handle_event(WalletEvent::AccountsChanged(vec![addr(2), addr(1)]));
        assert_eq!(switched.active_account(), Some(addr(2)));
        assert!(switched.epoch() > first.epoch());
        assert!(rx.has_changed().unwrap());

        let reset = sessions.handle_event(WalletEvent::ChainChanged(1));
        assert!(!reset.connected);
        assert_eq!(reset.account, None);
        assert_eq!(reset.chain_id, 1);

        let ignored = sessions.handle_event(WalletEvent::AccountsChanged(vec![addr(3)]));
        assert_eq!(ignored.epoch(), reset.epoch());
    }

    #[tokio::test]
    async fn notification_for_current_chain_keeps_session() {
        let wallet = Arc::new(MemoryWallet::new(vec![addr(1)], 1));
        wallet.add_known_chain(ChainParams::sepolia().chain_id);
        let sessions = manager(wallet);
        let connected = sessions.connect().await.unwrap();

        let after = sessions.handle_event(WalletEvent::ChainChanged(ChainParams::sepolia().chain_id));
        assert_eq!(after, connected);
        assert_eq!(sessions.current_session().active_account(), Some(addr(1)));
    }

    #[tokio::test]
    async fn wallet_watcher_applies_pushed_events() {
        let wallet = Arc::new(MemoryWallet::new(vec![addr(1), addr(2)], 1));
        wallet.add_known_chain(ChainParams::sepolia().chain_id);
        let sessions = Arc::new(manager(wallet.clone()));
        sessions.connect().await.unwrap();
        let mut rx = sessions.subscribe();
        rx.borrow_and_update();
        let _watcher = sessions.watch_wallet().await.unwrap();

        wallet.select_account(addr(2));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().active_account(), Some(addr(2)));

        wallet.select_chain(1);
        rx.changed().await.unwrap();
        let reset = rx.borrow_and_update().clone();
        assert!(!reset.connected);
        assert_eq!(reset.chain_id, 1);

        sessions.connect().await.unwrap();
        rx.borrow_and_update();
        wallet.lock();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().active_account(), None);
    }
}
