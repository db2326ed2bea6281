//! gRPC Bridge
//!
//! [`GrpcLedger`] and [`GrpcWallet`] implement the core's gateway and wallet
//! traits over the `microloan.v1` services. This module is the only place
//! that sees protobuf types: records are converted to core types here and
//! `tonic::Status` failures become [`LoanError`] / [`ProviderError`].

#[allow(dead_code)]
pub mod pb {
    tonic::include_proto!("microloan.v1");
}

use crate::config::{ChainParams, ClientConfig};
use crate::error::{LoanError, ProviderError, RawFailure};
use crate::gateway::{LedgerGateway, LoanEvent, LoanEventKind, PendingTx, Receipt, ReceiptStatus};
use crate::lifecycle::{self, Loan, RawLoanRecord};
use crate::session::{WalletEvent, WalletProvider};
use crate::types::{Address, Amount, LoanId, TxHash};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pb::{loan_ledger_client::LoanLedgerClient, wallet_client::WalletClient};
use tokio::sync::mpsc;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::{debug, warn};

/// Metadata entry carrying the wallet/provider error code of a failed call.
pub const PROVIDER_CODE_KEY: &str = "x-provider-code";

const STREAM_BUFFER: usize = 64;

/// Opens the channel both bridge clients share.
pub async fn connect(config: &ClientConfig) -> Result<Channel, LoanError> {
    let endpoint = Endpoint::from_shared(config.endpoint.clone())
        .map_err(|e| LoanError::Transport(format!("invalid endpoint {}: {}", config.endpoint, e)))?
        .connect_timeout(config.connect_timeout);
    let channel = endpoint
        .connect()
        .await
        .map_err(|e| LoanError::Transport(format!("cannot reach {}: {}", config.endpoint, e)))?;
    debug!(endpoint = %config.endpoint, "bridge channel open");
    Ok(channel)
}

fn is_transport(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled
    )
}

fn raw_failure(status: &Status) -> RawFailure {
    let code = status
        .metadata()
        .get(PROVIDER_CODE_KEY)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<i64>().ok());
    RawFailure::new(code, status.message())
}

pub fn ledger_error(status: Status) -> LoanError {
    if is_transport(&status) {
        return LoanError::Transport(status.message().to_string());
    }
    raw_failure(&status).classify()
}

pub fn provider_error(status: Status) -> ProviderError {
    if is_transport(&status) {
        return ProviderError::Transport(status.message().to_string());
    }
    ProviderError::Rpc(raw_failure(&status))
}

impl From<pb::LoanRecord> for RawLoanRecord {
    fn from(record: pb::LoanRecord) -> Self {
        Self {
            id: record.id,
            borrower: record.borrower,
            lender: record.lender,
            principal: record.principal,
            repayment: record.repayment,
            due_date: record.due_date,
            status: record.status,
        }
    }
}

fn receipt_from_reply(reply: pb::ReceiptReply) -> Result<Option<Receipt>, LoanError> {
    if !reply.found {
        return Ok(None);
    }
    let status = match reply.status() {
        pb::ReceiptStatus::Confirmed => ReceiptStatus::Confirmed,
        pb::ReceiptStatus::Reverted => ReceiptStatus::Reverted(reply.revert_reason.clone()),
        pb::ReceiptStatus::Unspecified => {
            return Err(LoanError::MalformedRecord(format!(
                "receipt {} has no status",
                reply.tx_hash
            )))
        }
    };
    Ok(Some(Receipt {
        hash: TxHash::new(reply.tx_hash),
        status,
        block: reply.block_number,
        loan_id: reply.loan_id,
    }))
}

fn event_from_message(message: &pb::LoanEventMessage) -> Option<LoanEvent> {
    let kind = match message.kind() {
        pb::LoanEventKind::Requested => LoanEventKind::Requested,
        pb::LoanEventKind::Funded => LoanEventKind::Funded,
        pb::LoanEventKind::Withdrawn => LoanEventKind::Withdrawn,
        pb::LoanEventKind::Repaid => LoanEventKind::Repaid,
        pb::LoanEventKind::Defaulted => LoanEventKind::Defaulted,
        pb::LoanEventKind::Unspecified => return None,
    };
    Some(LoanEvent {
        loan_id: message.loan_id,
        kind,
        block: message.block_number,
    })
}

fn parse_accounts(accounts: &[String]) -> Result<Vec<Address>, ProviderError> {
    accounts
        .iter()
        .map(|a| {
            a.parse::<Address>().map_err(|e| {
                ProviderError::Rpc(RawFailure::new(None, format!("wallet returned {}", e)))
            })
        })
        .collect()
}

fn wallet_event_from_message(message: &pb::WalletEventMessage) -> Option<WalletEvent> {
    match message.kind() {
        pb::WalletEventKind::AccountsChanged => parse_accounts(&message.accounts)
            .ok()
            .map(WalletEvent::AccountsChanged),
        pb::WalletEventKind::ChainChanged => Some(WalletEvent::ChainChanged(message.chain_id)),
        pb::WalletEventKind::Disconnected => Some(WalletEvent::Disconnected),
        pb::WalletEventKind::Unspecified => None,
    }
}

fn add_chain_request(chain: &ChainParams) -> pb::AddChainRequest {
    pb::AddChainRequest {
        chain_id_hex: chain.chain_id_hex(),
        chain_name: chain.chain_name.clone(),
        native_currency: Some(pb::NativeCurrency {
            name: chain.native_currency.name.clone(),
            symbol: chain.native_currency.symbol.clone(),
            decimals: chain.native_currency.decimals,
        }),
        rpc_urls: chain.rpc_urls.clone(),
        block_explorer_urls: chain.block_explorer_urls.clone(),
    }
}

/// Forwards a server stream into an mpsc channel until either side closes.
fn forward<M, T>(
    mut stream: tonic::codec::Streaming<M>,
    what: &'static str,
    convert: impl Fn(&M) -> Option<T> + Send + 'static,
) -> mpsc::Receiver<T>
where
    M: Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(async move {
        loop {
            match stream.message().await {
                Ok(Some(message)) => {
                    let Some(item) = convert(&message) else {
                        warn!(what, "skipping unrecognized stream message");
                        continue;
                    };
                    if tx.send(item).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(status) => {
                    warn!(what, code = ?status.code(), message = status.message(), "stream failed");
                    break;
                }
            }
        }
        debug!(what, "stream closed");
    });
    rx
}

/// Loan contract reached through the `LoanLedger` service.
#[derive(Clone)]
pub struct GrpcLedger {
    client: LoanLedgerClient<Channel>,
}

impl GrpcLedger {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: LoanLedgerClient::new(channel),
        }
    }

    async fn call(
        &self,
        from: Address,
        loan_id: LoanId,
        value: Amount,
        method: CallMethod,
    ) -> Result<PendingTx, LoanError> {
        let mut client = self.client.clone();
        let request = pb::LoanCallRequest {
            from: from.to_string(),
            loan_id,
            value: value.to_string(),
        };
        let response = match method {
            CallMethod::Fund => client.fund_loan(request).await,
            CallMethod::Withdraw => client.withdraw_to_borrower(request).await,
            CallMethod::Repay => client.repay_loan(request).await,
            CallMethod::MarkDefault => client.mark_default(request).await,
        }
        .map_err(ledger_error)?;
        Ok(PendingTx {
            hash: TxHash::new(response.into_inner().tx_hash),
        })
    }

    async fn ids(&self, request: IdsRequest) -> Result<Vec<LoanId>, LoanError> {
        let mut client = self.client.clone();
        let response = match request {
            IdsRequest::Borrower(address) => {
                client
                    .get_borrower_loans(pb::AccountLoansRequest {
                        address: address.to_string(),
                    })
                    .await
            }
            IdsRequest::Lender(address) => {
                client
                    .get_lender_loans(pb::AccountLoansRequest {
                        address: address.to_string(),
                    })
                    .await
            }
            IdsRequest::Requested => client.get_requested_loans(pb::RequestedLoansRequest {}).await,
        }
        .map_err(ledger_error)?;
        Ok(response.into_inner().loan_ids)
    }
}

enum CallMethod {
    Fund,
    Withdraw,
    Repay,
    MarkDefault,
}

enum IdsRequest {
    Borrower(Address),
    Lender(Address),
    Requested,
}

#[async_trait]
impl LedgerGateway for GrpcLedger {
    async fn get_loan(&self, loan_id: LoanId) -> Result<Loan, LoanError> {
        let mut client = self.client.clone();
        let record = client
            .get_loan(pb::GetLoanRequest { loan_id })
            .await
            .map_err(ledger_error)?
            .into_inner();
        lifecycle::normalize(record.into())
    }

    async fn get_borrower_loans(&self, borrower: Address) -> Result<Vec<LoanId>, LoanError> {
        self.ids(IdsRequest::Borrower(borrower)).await
    }

    async fn get_lender_loans(&self, lender: Address) -> Result<Vec<LoanId>, LoanError> {
        self.ids(IdsRequest::Lender(lender)).await
    }

    async fn get_requested_loans(&self) -> Result<Vec<LoanId>, LoanError> {
        self.ids(IdsRequest::Requested).await
    }

    async fn request_loan(
        &self,
        from: Address,
        principal: Amount,
        repayment: Amount,
        due_date: DateTime<Utc>,
    ) -> Result<PendingTx, LoanError> {
        let mut client = self.client.clone();
        let response = client
            .request_loan(pb::RequestLoanRequest {
                from: from.to_string(),
                principal: principal.to_string(),
                repayment: repayment.to_string(),
                due_date: due_date.timestamp(),
            })
            .await
            .map_err(ledger_error)?;
        Ok(PendingTx {
            hash: TxHash::new(response.into_inner().tx_hash),
        })
    }

    async fn fund_loan(
        &self,
        from: Address,
        loan_id: LoanId,
        value: Amount,
    ) -> Result<PendingTx, LoanError> {
        self.call(from, loan_id, value, CallMethod::Fund).await
    }

    async fn withdraw_to_borrower(
        &self,
        from: Address,
        loan_id: LoanId,
    ) -> Result<PendingTx, LoanError> {
        self.call(from, loan_id, Amount::ZERO, CallMethod::Withdraw).await
    }

    async fn repay_loan(
        &self,
        from: Address,
        loan_id: LoanId,
        value: Amount,
    ) -> Result<PendingTx, LoanError> {
        self.call(from, loan_id, value, CallMethod::Repay).await
    }

    async fn mark_default(&self, from: Address, loan_id: LoanId) -> Result<PendingTx, LoanError> {
        self.call(from, loan_id, Amount::ZERO, CallMethod::MarkDefault).await
    }

    async fn receipt(&self, tx: &TxHash) -> Result<Option<Receipt>, LoanError> {
        let mut client = self.client.clone();
        let reply = client
            .get_receipt(pb::ReceiptRequest {
                tx_hash: tx.as_str().to_string(),
            })
            .await
            .map_err(ledger_error)?
            .into_inner();
        receipt_from_reply(reply)
    }

    async fn loan_events(&self) -> Result<mpsc::Receiver<LoanEvent>, LoanError> {
        let mut client = self.client.clone();
        let stream = client
            .watch_loan_events(pb::WatchLoanEventsRequest {})
            .await
            .map_err(ledger_error)?
            .into_inner();
        Ok(forward(stream, "loan events", event_from_message))
    }
}

/// Wallet reached through the `Wallet` service.
#[derive(Clone)]
pub struct GrpcWallet {
    client: WalletClient<Channel>,
}

impl GrpcWallet {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: WalletClient::new(channel),
        }
    }
}

#[async_trait]
impl WalletProvider for GrpcWallet {
    async fn request_accounts(&self) -> Result<Vec<Address>, ProviderError> {
        let mut client = self.client.clone();
        let reply = client
            .request_accounts(pb::RequestAccountsRequest {})
            .await
            .map_err(provider_error)?
            .into_inner();
        parse_accounts(&reply.accounts)
    }

    async fn chain_id(&self) -> Result<u64, ProviderError> {
        let mut client = self.client.clone();
        let reply = client
            .get_chain_id(pb::ChainIdRequest {})
            .await
            .map_err(provider_error)?;
        Ok(reply.into_inner().chain_id)
    }

    async fn switch_chain(&self, chain: &ChainParams) -> Result<(), ProviderError> {
        let mut client = self.client.clone();
        client
            .switch_chain(pb::SwitchChainRequest {
                chain_id_hex: chain.chain_id_hex(),
            })
            .await
            .map_err(provider_error)?;
        Ok(())
    }

    async fn add_chain(&self, chain: &ChainParams) -> Result<(), ProviderError> {
        let mut client = self.client.clone();
        client
            .add_chain(add_chain_request(chain))
            .await
            .map_err(provider_error)?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<WalletEvent>, ProviderError> {
        let mut client = self.client.clone();
        let stream = client
            .watch_wallet(pb::WatchWalletRequest {})
            .await
            .map_err(provider_error)?
            .into_inner();
        Ok(forward(stream, "wallet events", wallet_event_from_message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, CODE_UNRECOGNIZED_CHAIN};

    fn with_code(code: Code, message: &str, provider_code: &str) -> Status {
        let mut status = Status::new(code, message);
        status
            .metadata_mut()
            .insert(PROVIDER_CODE_KEY, provider_code.parse().unwrap());
        status
    }

    #[test]
    fn provider_code_drives_classification() {
        let err = ledger_error(with_code(Code::Aborted, "transaction declined", "4001"));
        assert_eq!(err.kind(), ErrorKind::UserRejected);

        let err = provider_error(with_code(Code::NotFound, "Unrecognized chain ID", "4902"));
        assert_eq!(err.code(), Some(CODE_UNRECOGNIZED_CHAIN));
    }

    #[test]
    fn revert_reason_is_classified_verbatim() {
        let err = ledger_error(Status::failed_precondition("MicroLoan: loan not funded"));
        assert_eq!(err, LoanError::InvalidState("MicroLoan: loan not funded".to_string()));

        let err = ledger_error(Status::internal("execution reverted: 0x4e487b71"));
        assert_eq!(err.kind(), ErrorKind::ContractReverted);
    }

    #[test]
    fn unreachable_bridge_is_transport() {
        assert_eq!(
            ledger_error(Status::unavailable("connection refused")).kind(),
            ErrorKind::Transport
        );
        assert!(matches!(
            provider_error(Status::deadline_exceeded("slow")),
            ProviderError::Transport(_)
        ));
    }

    #[test]
    fn receipts_map_pending_and_reverted() {
        let pending = pb::ReceiptReply {
            found: false,
            ..Default::default()
        };
        assert_eq!(receipt_from_reply(pending).unwrap(), None);

        let reverted = pb::ReceiptReply {
            found: true,
            status: pb::ReceiptStatus::Reverted as i32,
            block_number: 7,
            revert_reason: "MicroLoan: loan past due".to_string(),
            loan_id: None,
            tx_hash: "0xabc".to_string(),
        };
        let receipt = receipt_from_reply(reverted).unwrap().unwrap();
        assert_eq!(
            receipt.status,
            ReceiptStatus::Reverted("MicroLoan: loan past due".to_string())
        );
        assert_eq!(receipt.block, 7);

        let broken = pb::ReceiptReply {
            found: true,
            ..Default::default()
        };
        assert_eq!(
            receipt_from_reply(broken).unwrap_err().kind(),
            ErrorKind::MalformedRecord
        );
    }

    #[test]
    fn wallet_events_convert() {
        let message = pb::WalletEventMessage {
            kind: pb::WalletEventKind::AccountsChanged as i32,
            accounts: vec![format!("0x{}", "ab".repeat(20))],
            chain_id: 0,
        };
        let Some(WalletEvent::AccountsChanged(accounts)) = wallet_event_from_message(&message) else {
            panic!("expected accounts change");
        };
        assert_eq!(accounts.len(), 1);

        let message = pb::WalletEventMessage {
            kind: pb::WalletEventKind::ChainChanged as i32,
            accounts: vec![],
            chain_id: 1,
        };
        assert_eq!(wallet_event_from_message(&message), Some(WalletEvent::ChainChanged(1)));
    }

    #[test]
    fn enum_names_follow_the_proto() {
        assert_eq!(pb::ReceiptStatus::Reverted.as_str_name(), "RECEIPT_STATUS_REVERTED");
        assert_eq!(
            pb::LoanEventKind::from_str_name("LOAN_EVENT_KIND_DEFAULTED"),
            Some(pb::LoanEventKind::Defaulted)
        );
        assert_eq!(
            pb::WalletEventKind::try_from(2).ok(),
            Some(pb::WalletEventKind::ChainChanged)
        );
    }

    #[test]
    fn add_chain_carries_hex_id() {
        let request = add_chain_request(&ChainParams::sepolia());
        assert_eq!(request.chain_id_hex, "0xaa36a7");
        assert_eq!(request.native_currency.unwrap().decimals, 18);
    }
}
