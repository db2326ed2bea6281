use super::app::{App, View};
use microloan::format::{format_due, format_eth, format_rate};
use microloan::{Action, Clock, Loan, LoanStatus};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, List, ListItem, Paragraph, Row, Table, Tabs, Wrap},
    Frame,
};

pub fn draw(f: &mut Frame, app: &mut App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Tabs
            Constraint::Min(0),    // Main content
            Constraint::Length(3), // Status bar
        ])
        .split(f.area());

    draw_tabs(f, app, chunks[0]);
    draw_main(f, app, chunks[1]);
    draw_status_bar(f, app, chunks[2]);
}

fn draw_tabs(f: &mut Frame, app: &App, area: Rect) {
    let titles: Vec<Line> = View::all()
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let num = format!("[{}] ", i + 1);
            let style = if *v == app.current_view {
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)
            } else {
                Style::default().fg(Color::Gray)
            };
            Line::from(vec![
                Span::styled(num, Style::default().fg(Color::DarkGray)),
                Span::styled(v.title(), style),
            ])
        })
        .collect();

    let session = app.client.session();
    let who = match session.active_account() {
        Some(account) => format!(" MicroLoan  {}  chain {} ", account.short(), session.chain_id),
        None => " MicroLoan  not connected [c to connect] ".to_string(),
    };

    let tabs = Tabs::new(titles)
        .block(Block::default().borders(Borders::ALL).title(who))
        .highlight_style(Style::default().fg(Color::Yellow))
        .select(View::all().iter().position(|v| *v == app.current_view).unwrap_or(0));

    f.render_widget(tabs, area);
}

fn draw_main(f: &mut Frame, app: &mut App, area: Rect) {
    match app.current_view {
        View::Portfolio => draw_portfolio(f, app, area),
        _ => draw_loans(f, app, area),
    }
}

fn status_color(status: LoanStatus) -> Color {
    match status {
        LoanStatus::Requested => Color::Cyan,
        LoanStatus::Funded => Color::Blue,
        LoanStatus::Withdrawn => Color::Yellow,
        LoanStatus::Repaid => Color::Green,
        LoanStatus::Defaulted => Color::Red,
    }
}

fn action_hint(actions: &[Action]) -> String {
    actions
        .iter()
        .map(|a| match a {
            Action::Fund => "f:fund",
            Action::Withdraw => "w:withdraw",
            Action::Repay => "p:repay",
            Action::MarkDefault => "d:default",
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn counterparty(app: &App, loan: &Loan) -> String {
    match app.current_view {
        View::Lending | View::Available => loan.borrower.short(),
        _ => loan
            .lender
            .map(|l| l.short())
            .unwrap_or_else(|| "-".to_string()),
    }
}

fn draw_loans(f: &mut Frame, app: &mut App, area: Rect) {
    let now = app.client.clock().now();
    let selected_idx = app.table_state.selected().unwrap_or(0);

    let header_style = Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD);
    let party = match app.current_view {
        View::Lending | View::Available => "Borrower",
        _ => "Lender",
    };
    let header = Row::new(
        ["Loan", party, "Principal", "Repayment", "Rate", "Due", "Status", "Actions"]
            .into_iter()
            .map(|h| Cell::from(h).style(header_style)),
    )
    .height(1)
    .bottom_margin(1);

    let loans = app.visible_loans();
    let total = loans.len();
    let rows: Vec<Row> = loans
        .iter()
        .enumerate()
        .map(|(i, loan)| {
            let selected = i == selected_idx;
            let style = if selected {
                Style::default().bg(Color::Blue).fg(Color::White)
            } else {
                Style::default()
            };
            let prefix = if selected { "▶ " } else { "  " };
            let status_style = Style::default().fg(if selected {
                Color::White
            } else {
                status_color(loan.status)
            });
            Row::new(vec![
                Cell::from(format!("{}#{}", prefix, loan.id)),
                Cell::from(counterparty(app, loan)),
                Cell::from(format_eth(loan.principal)),
                Cell::from(format_eth(loan.repayment)),
                Cell::from(format_rate(loan)),
                Cell::from(format_due(loan.due_date, now)),
                Cell::from(loan.status.label()).style(status_style),
                Cell::from(action_hint(&app.actions_for(loan))),
            ])
            .style(style)
        })
        .collect();

    let widths = [
        Constraint::Length(8),
        Constraint::Length(16),
        Constraint::Length(14),
        Constraint::Length(14),
        Constraint::Length(6),
        Constraint::Length(24),
        Constraint::Length(10),
        Constraint::Min(10),
    ];

    let title = if total == 0 {
        format!(" {} (none) ", app.current_view.title())
    } else {
        format!(" {} ({}/{}) ", app.current_view.title(), selected_idx + 1, total)
    };

    let table = Table::new(rows, widths).header(header).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Yellow))
            .title(title),
    );

    f.render_widget(table, area);
}

fn draw_portfolio(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(7), Constraint::Min(0)])
        .split(area);

    let lines = match app.loans.as_deref() {
        Some(set) => {
            let summary = set.summary();
            let stat = |label: &str, value: String| {
                Line::from(vec![
                    Span::styled(format!("{:<22}", label), Style::default().fg(Color::DarkGray)),
                    Span::styled(value, Style::default().fg(Color::White).add_modifier(Modifier::BOLD)),
                ])
            };
            vec![
                stat("Total invested", format_eth(summary.total_invested)),
                stat("Active investments", summary.active_investments.to_string()),
                stat("Total returns", format_eth(summary.total_returns)),
                stat("Average return rate", format!("{:.1}%", summary.average_return_rate)),
                stat("Loans borrowed", set.borrowed().count().to_string()),
            ]
        }
        None => vec![Line::from(Span::styled(
            "  No loan data. Press r to refresh.",
            Style::default().fg(Color::DarkGray),
        ))],
    };

    let stats = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Yellow))
            .title(" Portfolio "),
    );
    f.render_widget(stats, chunks[0]);

    let total = app.history.len();
    let items: Vec<ListItem> = if app.history.is_empty() {
        vec![ListItem::new(Line::from(Span::styled(
            "  No confirmed actions this session.",
            Style::default().fg(Color::DarkGray),
        )))]
    } else {
        app.history
            .iter()
            .rev()
            .enumerate()
            .map(|(i, h)| {
                let num = format!("{:>3}. ", total - i);
                ListItem::new(Line::from(vec![
                    Span::styled(num, Style::default().fg(Color::DarkGray)),
                    Span::styled(h.clone(), Style::default().fg(Color::White)),
                ]))
            })
            .collect()
    };
    let list = List::new(items).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" History ({} total) ", total)),
    );
    f.render_widget(list, chunks[1]);
}

fn draw_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let help_text = if app.loading {
        "Working...".to_string()
    } else {
        match app.current_view {
            View::Portfolio => " ←/→:Tabs  r:Refresh  c:Connect  q:Quit ".to_string(),
            _ => " ↑/↓:Select  f/w/p/d:Act  r:Refresh  c:Connect  q:Quit ".to_string(),
        }
    };

    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    let help_style = if app.loading {
        Style::default().fg(Color::Yellow)
    } else {
        Style::default().fg(Color::Cyan)
    };
    let help = Paragraph::new(Line::from(Span::styled(help_text, help_style)))
        .block(Block::default().borders(Borders::ALL).title(" Keys "));

    let info = match (&app.last_error, &app.status_message) {
        (Some(err), _) => Line::from(vec![
            Span::styled(
                format!("✗ {}: ", err.kind().label()),
                Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
            ),
            Span::styled(err.to_string(), Style::default().fg(Color::Red)),
        ]),
        (None, Some(message)) => Line::from(vec![
            Span::styled("✓ ", Style::default().fg(Color::Green)),
            Span::styled(message.as_str(), Style::default().fg(Color::Green)),
        ]),
        (None, None) => Line::from(""),
    };
    let info_widget = Paragraph::new(info)
        .wrap(Wrap { trim: true })
        .block(Block::default().borders(Borders::ALL).title(" Status "));

    f.render_widget(help, chunks[0]);
    f.render_widget(info_widget, chunks[1]);
}
