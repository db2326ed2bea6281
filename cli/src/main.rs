mod ui;

use anyhow::{bail, Context, Result};
use chrono::Duration as ChronoDuration;
use clap::{Parser, Subcommand, ValueEnum};
use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use microloan::config::{ChainParams, ClientConfig, DEFAULT_ENDPOINT, SEPOLIA_CHAIN_ID};
use microloan::format::{format_eth, format_rate};
use microloan::lifecycle::{preview_repayment, status_label};
use microloan::memory::{MemoryLedger, MemoryWallet};
use microloan::{
    Action, Address, Amount, Clock, LedgerGateway, Loan, LoanClient, LoanError, LoanId,
    LoanRequest, RetryPolicy, SystemClock,
};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::io;
use std::panic;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use ui::{run_app, App};

#[derive(Parser, Debug)]
#[command(name = "microloan")]
#[command(about = "Client for the MicroLoan ledger", long_about = None)]
struct Args {
    /// gRPC bridge address
    #[arg(short, long, env = "MICROLOAN_GRPC_URL", default_value = DEFAULT_ENDPOINT)]
    server: String,

    /// Chain id the wallet must be on
    #[arg(long, default_value_t = SEPOLIA_CHAIN_ID)]
    chain_id: u64,

    #[arg(long, default_value_t = 5)]
    connect_timeout_secs: u64,

    /// Receipt polling interval
    #[arg(long, default_value_t = 2000)]
    poll_interval_ms: u64,

    /// Give up waiting for a confirmation after this long (the transaction stays pending)
    #[arg(long)]
    confirmation_timeout_secs: Option<u64>,

    /// Attempts per ledger read before giving up on a transport error
    #[arg(long, default_value_t = 4)]
    read_attempts: usize,

    /// Use a seeded in-memory ledger and wallet instead of the bridge
    #[arg(long)]
    offline: bool,

    /// Offline only: act as this demo account
    #[arg(long, requires = "offline")]
    account: Option<Address>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect, verify the chain and report what the account can see
    Check,
    /// List loans for the connected account
    Loans {
        #[arg(long, value_enum, default_value_t = LoanView::All)]
        view: LoanView,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Lender portfolio figures
    Stats,
    /// Request a new loan
    Request {
        /// Principal in ETH
        #[arg(long, value_parser = parse_eth)]
        principal: Amount,
        /// Total repayment in ETH
        #[arg(long, value_parser = parse_eth, conflicts_with = "rate_bps")]
        repayment: Option<Amount>,
        /// Interest in basis points, used to compute the repayment
        #[arg(long)]
        rate_bps: Option<u32>,
        /// Term in days
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
    /// Fund a requested loan (sends the principal unless --value is given)
    Fund {
        loan_id: LoanId,
        #[arg(long, value_parser = parse_eth)]
        value: Option<Amount>,
    },
    /// Withdraw a funded loan to the borrower
    Withdraw { loan_id: LoanId },
    /// Repay a withdrawn loan (sends the repayment unless --value is given)
    Repay {
        loan_id: LoanId,
        #[arg(long, value_parser = parse_eth)]
        value: Option<Amount>,
    },
    /// Mark an overdue loan as defaulted
    Default { loan_id: LoanId },
    /// Print ledger events as they arrive
    Watch,
    /// Terminal dashboard (default)
    Dashboard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LoanView {
    All,
    Borrowed,
    Lent,
    Available,
}

fn parse_eth(s: &str) -> Result<Amount, String> {
    Amount::parse_native(s).map_err(|e| e.to_string())
}

impl Args {
    fn config(&self) -> Result<ClientConfig> {
        let chain = if self.chain_id == SEPOLIA_CHAIN_ID {
            ChainParams::sepolia()
        } else {
            ChainParams {
                chain_id: self.chain_id,
                chain_name: format!("Chain {}", self.chain_id),
                ..ChainParams::sepolia()
            }
        };
        let defaults = RetryPolicy::default();
        let config = ClientConfig {
            endpoint: self.server.clone(),
            chain,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            confirmation_timeout: self.confirmation_timeout_secs.map(Duration::from_secs),
            read_retry: RetryPolicy::new(
                self.read_attempts,
                defaults.base_delay_ms,
                defaults.max_delay_ms,
                defaults.jitter_pct,
            ),
        };
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn init_tracing(dashboard: bool) {
    // The dashboard owns the terminal, so stay quiet unless asked.
    let default = if dashboard { "off" } else { "microloan=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn cleanup_terminal() {
    let _ = disable_raw_mode();
    let _ = execute!(io::stdout(), LeaveAlternateScreen, DisableMouseCapture);
}

const DEMO_LENDER: &str = "0x70997970c51812dc3a010c7d01b50e0d17dc79c8";
const DEMO_BORROWER: &str = "0x3c44cdddb6a900fa2b585dd299e03d12fa4293bc";
const DEMO_OTHER: &str = "0x90f79bf6eb2c4f870365e785982e1f101e93b906";

/// In-memory ledger seeded with a few loans at different stages.
async fn offline_client(config: &ClientConfig, account: Option<Address>) -> Result<LoanClient> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ledger = Arc::new(MemoryLedger::new(Arc::clone(&clock)));
    let lender: Address = DEMO_LENDER.parse()?;
    let borrower: Address = DEMO_BORROWER.parse()?;
    let other: Address = DEMO_OTHER.parse()?;
    let eth = |s: &str| Amount::parse_native(s);
    let now = clock.now();

    let seed = [
        (borrower, "0.5", "0.55", 30),
        (other, "1.2", "1.32", 60),
        (borrower, "0.25", "0.2625", 14),
        (other, "2", "2.3", 90),
    ];
    for (who, principal, repayment, days) in seed {
        ledger
            .request_loan(who, eth(principal)?, eth(repayment)?, now + ChronoDuration::days(days))
            .await?;
    }
    ledger.fund_loan(lender, 1, eth("1.2")?).await?;
    ledger.withdraw_to_borrower(other, 1).await?;
    ledger.fund_loan(lender, 2, eth("0.25")?).await?;

    let mut accounts = vec![lender, borrower, other];
    if let Some(account) = account {
        accounts.retain(|a| *a != account);
        accounts.insert(0, account);
    }
    let wallet = Arc::new(MemoryWallet::new(accounts, config.chain.chain_id));
    Ok(LoanClient::new(config, ledger, wallet, clock))
}

fn print_loans<'a>(title: &str, loans: impl Iterator<Item = &'a Loan>, now: chrono::DateTime<chrono::Utc>) {
    println!("{}:", title);
    let mut any = false;
    for loan in loans {
        any = true;
        let overdue = if loan.is_overdue(now) && !loan.status.is_terminal() {
            " overdue"
        } else {
            ""
        };
        println!(
            "  #{:<4} {:<10} {:>14} -> {:>14}  {:>4}  due {}{}",
            loan.id,
            status_label(loan.status.code()),
            format_eth(loan.principal),
            format_eth(loan.repayment),
            format_rate(loan),
            loan.due_date.format("%Y-%m-%d"),
            overdue,
        );
    }
    if !any {
        println!("  (none)");
    }
}

async fn run_command(client: Arc<LoanClient>, command: Command) -> Result<()> {
    match command {
        Command::Dashboard => run_dashboard(client).await?,
        Command::Check => {
            let session = client.connect().await?;
            let account = session.active_account().ok_or(LoanError::NotConnected)?;
            println!("✅ Connected as {} on chain {}", account, session.chain_id);
            let set = client.loans().await?;
            println!(
                "Found {} loans ({} borrowed, {} lent, {} available)",
                set.len(),
                set.borrowed().count(),
                set.lent().count(),
                set.available().count()
            );
        }
        Command::Loans { view, json } => {
            client.connect().await?;
            let set = client.loans().await?;
            let now = client.clock().now();
            if json {
                let selected: Vec<&Loan> = match view {
                    LoanView::All => set.iter().collect(),
                    LoanView::Borrowed => set.borrowed().collect(),
                    LoanView::Lent => set.lent().collect(),
                    LoanView::Available => set.available().collect(),
                };
                println!("{}", serde_json::to_string_pretty(&selected)?);
                return Ok(());
            }
            if matches!(view, LoanView::All | LoanView::Borrowed) {
                print_loans("Borrowed", set.borrowed(), now);
            }
            if matches!(view, LoanView::All | LoanView::Lent) {
                print_loans("Lent", set.lent(), now);
            }
            if matches!(view, LoanView::All | LoanView::Available) {
                print_loans("Available", set.available(), now);
            }
        }
        Command::Stats => {
            client.connect().await?;
            let summary = client.loans().await?.summary();
            println!("Total invested:      {}", format_eth(summary.total_invested));
            println!("Active investments:  {}", summary.active_investments);
            println!("Total returns:       {}", format_eth(summary.total_returns));
            println!("Average return rate: {:.1}%", summary.average_return_rate);
        }
        Command::Request {
            principal,
            repayment,
            rate_bps,
            days,
        } => {
            let repayment = match (repayment, rate_bps) {
                (Some(r), _) => r,
                (None, Some(bps)) => preview_repayment(principal, bps)
                    .context("repayment overflows")?,
                (None, None) => bail!("give either --repayment or --rate-bps"),
            };
            client.connect().await?;
            let request = LoanRequest {
                principal,
                repayment,
                due_date: client.clock().now() + ChronoDuration::days(days),
            };
            let done = client.request(request).await?;
            println!(
                "Requested loan #{} for {} (repay {}) in block {}",
                done.loan_id,
                format_eth(principal),
                format_eth(repayment),
                done.block
            );
        }
        Command::Fund { loan_id, value } => submit(&client, Action::Fund, loan_id, value).await?,
        Command::Withdraw { loan_id } => submit(&client, Action::Withdraw, loan_id, None).await?,
        Command::Repay { loan_id, value } => submit(&client, Action::Repay, loan_id, value).await?,
        Command::Default { loan_id } => {
            submit(&client, Action::MarkDefault, loan_id, None).await?
        }
        Command::Watch => {
            client.connect().await?;
            let _watchers = client.start_watchers().await?;
            let mut events = client.gateway().loan_events().await?;
            println!("Watching ledger events (Ctrl+C to stop)...");
            while let Some(event) = events.recv().await {
                println!("block {:>6}  loan #{:<4} {:?}", event.block, event.loan_id, event.kind);
            }
        }
    }
    Ok(())
}

async fn submit(
    client: &LoanClient,
    action: Action,
    loan_id: LoanId,
    value: Option<Amount>,
) -> Result<()> {
    client.connect().await?;
    let done = client.submit(action, loan_id, value).await?;
    println!("✅ {} loan #{} confirmed in block {} ({})", action, loan_id, done.block, done.tx);
    if let Some(loan) = done.loans.as_ref().and_then(|set| set.get(loan_id)) {
        println!("   status is now {}", loan.status);
    }
    Ok(())
}

async fn run_dashboard(client: Arc<LoanClient>) -> Result<()> {
    // A failed connect is reported in the status bar; `c` retries it.
    let app = App::start(Arc::clone(&client)).await;
    let _watchers = client.start_watchers().await?;

    // Set up panic hook to restore terminal
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        cleanup_terminal();
        original_hook(panic_info);
    }));

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, app).await;

    cleanup_terminal();
    terminal.show_cursor()?;
    res
}

fn report(err: &anyhow::Error) {
    match err.downcast_ref::<LoanError>() {
        Some(loan_err) => {
            eprintln!("❌ {}: {}", loan_err.kind().label(), loan_err);
            if loan_err.is_recoverable() {
                eprintln!("   This can be retried once the cause is fixed.");
            }
        }
        None => eprintln!("❌ {:#}", err),
    }
}

#[tokio::main]
async fn main() {
    let mut args = Args::parse();
    let command = args.command.take().unwrap_or(Command::Dashboard);
    init_tracing(matches!(command, Command::Dashboard));

    if let Err(err) = run(args, command).await {
        report(&err);
        std::process::exit(1);
    }
}

async fn run(args: Args, command: Command) -> Result<()> {
    let config = args.config()?;
    let client = if args.offline {
        offline_client(&config, args.account).await?
    } else {
        LoanClient::connect_grpc(&config).await.with_context(|| {
            format!(
                "make sure the MicroLoan bridge is running on {}",
                config.endpoint
            )
        })?
    };
    run_command(Arc::new(client), command).await
}
