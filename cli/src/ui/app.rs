//! Dashboard State and Event Loop
//!
//! `App` holds what the dashboard shows: the current tab, the last loan set
//! read from the repository and the outcome of the last action. `run_app`
//! draws, reads keys and forwards actions to the client. Errors are shown
//! with the kind the core assigned; nothing is classified here.

use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use microloan::format::format_eth;
use microloan::{Action, Loan, LoanClient, LoanError, LoanSet};
use ratatui::{backend::CrosstermBackend, widgets::TableState, Terminal};
use std::io::Stdout;
use std::sync::Arc;

pub type AppResult<T> = Result<T>;

/// Confirmed actions kept for the portfolio tab.
const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Borrowing,
    Lending,
    Available,
    Portfolio,
}

impl View {
    pub fn all() -> Vec<View> {
        vec![View::Borrowing, View::Lending, View::Available, View::Portfolio]
    }

    pub fn title(&self) -> &'static str {
        match self {
            View::Borrowing => "My Loans",
            View::Lending => "My Investments",
            View::Available => "Available",
            View::Portfolio => "Portfolio",
        }
    }
}

pub struct App {
    pub client: Arc<LoanClient>,
    pub current_view: View,
    pub running: bool,

    pub loans: Option<Arc<LoanSet>>,
    pub table_state: TableState,
    pub session_epoch: u64,

    pub history: Vec<String>,
    pub status_message: Option<String>,
    pub last_error: Option<LoanError>,
    pub loading: bool,
}

impl App {
    pub fn new(client: Arc<LoanClient>) -> Self {
        let mut table_state = TableState::default();
        table_state.select(Some(0));
        let session_epoch = client.session().epoch();
        Self {
            client,
            current_view: View::Borrowing,
            running: true,
            loans: None,
            table_state,
            session_epoch,
            history: Vec::new(),
            status_message: None,
            last_error: None,
            loading: false,
        }
    }

    /// Connects the wallet and loads the first loan set. A failed connect is
    /// kept as the shown error instead of the `NotConnected` a load would give.
    pub async fn start(client: Arc<LoanClient>) -> Self {
        let mut app = Self::new(client);
        match app.client.connect().await {
            Ok(_) => app.load_loans().await,
            Err(err) => {
                app.session_epoch = app.client.session().epoch();
                app.last_error = Some(err);
            }
        }
        app
    }

    fn record(&mut self, entry: String) {
        self.history.push(entry);
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
    }

    pub async fn load_loans(&mut self) {
        self.loading = true;
        match self.client.loans().await {
            Ok(set) => {
                self.loans = Some(set);
                self.last_error = None;
            }
            Err(err) => {
                self.loans = None;
                self.last_error = Some(err);
            }
        }
        self.session_epoch = self.client.session().epoch();
        self.clamp_selection();
        self.loading = false;
    }

    pub async fn refresh(&mut self) {
        self.loading = true;
        match self.client.refresh().await {
            Ok(set) => {
                self.loans = Some(set);
                self.status_message = Some("Refreshed".to_string());
                self.last_error = None;
            }
            Err(err) => self.last_error = Some(err),
        }
        self.clamp_selection();
        self.loading = false;
    }

    /// Picks up session changes and refreshes made by background watchers.
    pub async fn sync(&mut self) {
        if self.client.session().epoch() != self.session_epoch {
            self.status_message = Some("Session changed, reloading".to_string());
            self.load_loans().await;
            return;
        }
        if let Some(set) = self.client.repository().cached().await {
            let changed = self.loans.as_ref().map_or(true, |current| !Arc::ptr_eq(current, &set));
            if changed {
                self.loans = Some(set);
                self.clamp_selection();
            }
        }
    }

    /// Loans listed on the current tab.
    pub fn visible_loans(&self) -> Vec<&Loan> {
        let Some(set) = self.loans.as_deref() else {
            return Vec::new();
        };
        match self.current_view {
            View::Borrowing => set.borrowed().collect(),
            View::Lending => set.lent().collect(),
            View::Available => set.available().collect(),
            View::Portfolio => Vec::new(),
        }
    }

    pub fn selected_loan(&self) -> Option<Loan> {
        let idx = self.table_state.selected()?;
        self.visible_loans().get(idx).map(|loan| (*loan).clone())
    }

    pub fn actions_for(&self, loan: &Loan) -> Vec<Action> {
        self.client.actions_for(loan)
    }

    pub async fn perform(&mut self, action: Action) {
        let Some(loan) = self.selected_loan() else {
            return;
        };
        if !self.actions_for(&loan).contains(&action) {
            self.status_message = Some(format!("Cannot {} loan #{} now", action, loan.id));
            return;
        }

        self.loading = true;
        match self.client.submit(action, loan.id, None).await {
            Ok(done) => {
                let sent = loan
                    .required_value(action)
                    .map(|v| format!(" ({})", format_eth(v)))
                    .unwrap_or_default();
                let entry = format!("{} loan #{}{} in block {}", action, loan.id, sent, done.block);
                self.record(entry.clone());
                self.status_message = Some(entry);
                self.last_error = None;
                if let Some(set) = done.loans {
                    self.loans = Some(set);
                }
            }
            Err(err) => self.last_error = Some(err),
        }
        self.clamp_selection();
        self.loading = false;
    }

    fn clamp_selection(&mut self) {
        let len = self.visible_loans().len();
        let selected = self.table_state.selected().unwrap_or(0);
        self.table_state
            .select(Some(selected.min(len.saturating_sub(1))));
    }

    pub fn next_view(&mut self) {
        let views = View::all();
        let idx = views
            .iter()
            .position(|v| *v == self.current_view)
            .unwrap_or(0);
        self.current_view = views[(idx + 1) % views.len()];
        self.table_state.select(Some(0));
    }

    pub fn prev_view(&mut self) {
        let views = View::all();
        let idx = views
            .iter()
            .position(|v| *v == self.current_view)
            .unwrap_or(0);
        self.current_view = views[(idx + views.len() - 1) % views.len()];
        self.table_state.select(Some(0));
    }

    pub fn goto_view(&mut self, index: usize) {
        let views = View::all();
        if index < views.len() {
            self.current_view = views[index];
            self.table_state.select(Some(0));
        }
    }

    pub fn select_next(&mut self) {
        let i = self.table_state.selected().unwrap_or(0);
        if i < self.visible_loans().len().saturating_sub(1) {
            self.table_state.select(Some(i + 1));
        }
    }

    pub fn select_prev(&mut self) {
        let i = self.table_state.selected().unwrap_or(0);
        if i > 0 {
            self.table_state.select(Some(i - 1));
        }
    }
}

fn action_for_key(code: KeyCode) -> Option<Action> {
    match code {
        KeyCode::Char('f') => Some(Action::Fund),
        KeyCode::Char('w') => Some(Action::Withdraw),
        KeyCode::Char('p') => Some(Action::Repay),
        KeyCode::Char('d') => Some(Action::MarkDefault),
        _ => None,
    }
}

pub async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    mut app: App,
) -> AppResult<()> {
    loop {
        app.sync().await;
        terminal.draw(|f| super::views::draw(f, &mut app))?;

        if event::poll(std::time::Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    if key.modifiers.contains(KeyModifiers::CONTROL)
                        && key.code == KeyCode::Char('c')
                    {
                        app.running = false;
                        continue;
                    }

                    if let Some(action) = action_for_key(key.code) {
                        // Show the pending state before blocking on confirmation.
                        app.loading = true;
                        app.status_message = Some(format!("Waiting for {} confirmation...", action));
                        terminal.draw(|f| super::views::draw(f, &mut app))?;
                        app.perform(action).await;
                        continue;
                    }

                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => app.running = false,
                        KeyCode::Tab | KeyCode::Right => app.next_view(),
                        KeyCode::BackTab | KeyCode::Left => app.prev_view(),
                        KeyCode::Char('1') => app.goto_view(0),
                        KeyCode::Char('2') => app.goto_view(1),
                        KeyCode::Char('3') => app.goto_view(2),
                        KeyCode::Char('4') => app.goto_view(3),
                        KeyCode::Down | KeyCode::Char('j') => app.select_next(),
                        KeyCode::Up | KeyCode::Char('k') => app.select_prev(),
                        KeyCode::Char('r') => app.refresh().await,
                        KeyCode::Char('c') => {
                            match app.client.connect().await {
                                Ok(session) => {
                                    app.status_message = session
                                        .active_account()
                                        .map(|a| format!("Connected as {}", a.short()));
                                }
                                Err(err) => app.last_error = Some(err),
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        if !app.running {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use microloan::memory::{MemoryLedger, MemoryWallet};
    use microloan::{Address, ClientConfig, Clock, ErrorKind, ManualClock};

    fn client(wallet: Arc<MemoryWallet>) -> Arc<LoanClient> {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        let ledger = Arc::new(MemoryLedger::new(Arc::clone(&clock)));
        Arc::new(LoanClient::new(&ClientConfig::default(), ledger, wallet, clock))
    }

    fn wallet() -> Arc<MemoryWallet> {
        let account = Address::from_bytes([7u8; 20]);
        Arc::new(MemoryWallet::new(
            vec![account],
            ClientConfig::default().chain.chain_id,
        ))
    }

    #[tokio::test]
    async fn start_shows_connect_failure_kind() {
        let wallet = wallet();
        wallet.set_user_approves(false);
        let app = App::start(client(wallet)).await;
        assert_eq!(
            app.last_error.as_ref().map(LoanError::kind),
            Some(ErrorKind::UserRejected)
        );
        assert!(app.loans.is_none());
    }

    #[tokio::test]
    async fn start_loads_when_connected() {
        let app = App::start(client(wallet())).await;
        assert!(app.last_error.is_none());
        assert!(app.loans.is_some());
    }

    #[tokio::test]
    async fn history_keeps_latest_entries() {
        let mut app = App::new(client(wallet()));
        for i in 0..HISTORY_LIMIT + 5 {
            app.record(format!("entry {}", i));
        }
        assert_eq!(app.history.len(), HISTORY_LIMIT);
        assert_eq!(app.history.first().map(String::as_str), Some("entry 5"));
        assert_eq!(
            app.history.last().cloned(),
            Some(format!("entry {}", HISTORY_LIMIT + 4))
        );
    }
}
