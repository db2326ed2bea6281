//! Display helpers shared by the CLI and the dashboard.

use crate::lifecycle::Loan;
use crate::types::{Amount, NATIVE_DECIMALS};
use chrono::{DateTime, Utc};

const DISPLAY_DECIMALS: u32 = 4;

/// Formats base units as a native-currency amount with four decimals,
/// truncating the rest.
pub fn format_native(amount: Amount) -> String {
    let scale = 10u128.pow(NATIVE_DECIMALS);
    let units = amount.base_units();
    let whole = units / scale;
    let frac = (units % scale) / 10u128.pow(NATIVE_DECIMALS - DISPLAY_DECIMALS);
    format!("{}.{:0width$}", whole, frac, width = DISPLAY_DECIMALS as usize)
}

pub fn format_eth(amount: Amount) -> String {
    format!("{} ETH", format_native(amount))
}

pub fn format_rate(loan: &Loan) -> String {
    format!("{}%", loan.interest_rate_percent())
}

/// Due date with a countdown; under a day the countdown is in hours.
pub fn format_due(due: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let date = due.format("%Y-%m-%d");
    if due < now {
        let late = now - due;
        return match late.num_days() {
            0 => format!("{} (overdue {}h)", date, late.num_hours().max(1)),
            d => format!("{} (overdue {}d)", date, d),
        };
    }
    let left = due - now;
    match left.num_days() {
        0 => format!("{} (in {}h)", date, left.num_hours()),
        d => format!("{} (in {}d)", date, d),
    }
}
