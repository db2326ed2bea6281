//! Client core for the MicroLoan ledger.
//!
//! - `session`: wallet connection and the published [`Session`] value
//! - `gateway`: typed seam over the loan contract ([`LedgerGateway`])
//! - `lifecycle`: record normalization and the loan transition table
//! - `repository`: per-session loan cache with full-replace refresh
//! - `coordinator`: submit, confirm, refresh
//! - `grpc` / `memory`: bridge and in-process implementations of the seams

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod format;
pub mod gateway;
pub mod grpc;
pub mod lifecycle;
pub mod memory;
pub mod repository;
pub mod retry;
pub mod session;
pub mod types;

pub use client::LoanClient;
pub use config::{ChainParams, ClientConfig, ConfigError};
pub use coordinator::{Confirmation, TransactionCoordinator};
pub use error::{ErrorKind, LoanError, ProviderError, RawFailure};
pub use gateway::{LedgerGateway, LoanEvent, LoanEventKind, PendingTx, Receipt, ReceiptStatus};
pub use lifecycle::{Action, Loan, LoanRequest, LoanStatus, RawLoanRecord};
pub use repository::{LoanRepository, LoanSet, PortfolioSummary};
pub use retry::RetryPolicy;
pub use session::{Session, SessionManager, WalletEvent, WalletProvider};
pub use types::{Address, Amount, Clock, LoanId, ManualClock, SystemClock, TxHash};
