//! Loan Lifecycle
//!
//! Pure mapping from raw ledger records to [`Loan`] values, plus the
//! transition table that decides which actions are legal:
//!
//! ```text
//! Requested --fund--> Funded --withdraw--> Withdrawn --repay--------> Repaid
//!                                                    \--markDefault--> Defaulted
//! ```
//!
//! Nothing in here performs I/O; `now` is always passed in.

use crate::error::LoanError;
use crate::types::{Address, Amount, LoanId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Longest term the ledger accepts for a new loan.
pub const MAX_TERM_DAYS: i64 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum LoanStatus {
    Requested,
    Funded,
    Withdrawn,
    Repaid,
    Defaulted,
}

impl LoanStatus {
    /// Decodes the ledger's `uint8` status code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(LoanStatus::Requested),
            1 => Some(LoanStatus::Funded),
            2 => Some(LoanStatus::Withdrawn),
            3 => Some(LoanStatus::Repaid),
            4 => Some(LoanStatus::Defaulted),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            LoanStatus::Requested => 0,
            LoanStatus::Funded => 1,
            LoanStatus::Withdrawn => 2,
            LoanStatus::Repaid => 3,
            LoanStatus::Defaulted => 4,
        }
    }

    /// The one label every view uses for a status.
    pub fn label(self) -> &'static str {
        match self {
            LoanStatus::Requested => "Requested",
            LoanStatus::Funded => "Funded",
            LoanStatus::Withdrawn => "Withdrawn",
            LoanStatus::Repaid => "Repaid",
            LoanStatus::Defaulted => "Defaulted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LoanStatus::Repaid | LoanStatus::Defaulted)
    }
}

impl fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Label for a raw status code, `"Unknown"` for codes the ledger should never emit.
pub fn status_label(code: u32) -> &'static str {
    LoanStatus::from_code(code)
        .map(LoanStatus::label)
        .unwrap_or("Unknown")
}

/// A mutating action on an existing loan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Action {
    Fund,
    Withdraw,
    Repay,
    MarkDefault,
}

impl Action {
    pub const ALL: [Action; 4] = [
        Action::Fund,
        Action::Withdraw,
        Action::Repay,
        Action::MarkDefault,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Action::Fund => "fund",
            Action::Withdraw => "withdraw",
            Action::Repay => "repay",
            Action::MarkDefault => "mark default",
        }
    }

    pub fn is_payable(self) -> bool {
        matches!(self, Action::Fund | Action::Repay)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A loan record exactly as the ledger returns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLoanRecord {
    pub id: LoanId,
    pub borrower: String,
    pub lender: String,
    pub principal: String,
    pub repayment: String,
    pub due_date: i64,
    pub status: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Loan {
    pub id: LoanId,
    pub borrower: Address,
    pub lender: Option<Address>,
    pub principal: Amount,
    pub repayment: Amount,
    pub due_date: DateTime<Utc>,
    pub status: LoanStatus,
}

impl Loan {
    pub fn interest(&self) -> Amount {
        self.repayment.saturating_sub(self.principal)
    }

    /// `(repayment - principal) / principal`
    pub fn interest_rate(&self) -> f64 {
        if self.principal.is_zero() {
            return 0.0;
        }
        self.interest().base_units() as f64 / self.principal.base_units() as f64
    }

    /// Whole-percent interest rate, rounded down.
    pub fn interest_rate_percent(&self) -> u128 {
        if self.principal.is_zero() {
            return 0;
        }
        self.interest().base_units().saturating_mul(100) / self.principal.base_units()
    }

    /// Display-only completion percentage.
    pub fn progress(&self) -> u8 {
        match self.status {
            LoanStatus::Repaid => 100,
            _ => 0,
        }
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        now > self.due_date
    }

    /// The exact value the ledger expects to receive with `action`.
    pub fn required_value(&self, action: Action) -> Option<Amount> {
        match action {
            Action::Fund => Some(self.principal),
            Action::Repay => Some(self.repayment),
            Action::Withdraw | Action::MarkDefault => None,
        }
    }

    pub fn involves(&self, account: &Address) -> bool {
        self.borrower == *account || self.lender.as_ref() == Some(account)
    }
}

/// Parses a raw record, rejecting anything that breaks the loan invariants.
pub fn normalize(raw: RawLoanRecord) -> Result<Loan, LoanError> {
    let malformed = |what: String| LoanError::MalformedRecord(format!("loan {}: {}", raw.id, what));

    let borrower: Address = raw.borrower.parse().map_err(|e| malformed(format!("{}", e)))?;
    let lender: Address = if raw.lender.trim().is_empty() {
        Address::ZERO
    } else {
        raw.lender.parse().map_err(|e| malformed(format!("{}", e)))?
    };
    let principal: Amount = raw.principal.parse().map_err(|e| malformed(format!("{}", e)))?;
    let repayment: Amount = raw.repayment.parse().map_err(|e| malformed(format!("{}", e)))?;
    let status = LoanStatus::from_code(raw.status)
        .ok_or_else(|| malformed(format!("unknown status code {}", raw.status)))?;
    let due_date = DateTime::from_timestamp(raw.due_date, 0)
        .ok_or_else(|| malformed(format!("due date {} out of range", raw.due_date)))?;

    if borrower.is_zero() {
        return Err(malformed("borrower is the zero address".to_string()));
    }
    if principal.is_zero() {
        return Err(malformed("principal is zero".to_string()));
    }
    if repayment <= principal {
        return Err(malformed(format!(
            "repayment {} does not exceed principal {}",
            repayment, principal
        )));
    }

    let lender = (!lender.is_zero()).then_some(lender);
    match (status, lender) {
        (LoanStatus::Requested, Some(l)) => {
            return Err(malformed(format!("requested loan already has lender {}", l)));
        }
        (s, None) if s != LoanStatus::Requested => {
            return Err(malformed(format!("{} loan has no lender", s)));
        }
        _ => {}
    }

    Ok(Loan {
        id: raw.id,
        borrower,
        lender,
        principal,
        repayment,
        due_date,
        status,
    })
}

/// Checks `action` against the transition table and returns the status the
/// loan moves to.
///
/// Due-date guard violations report `Expired`; every other violation reports
/// `InvalidState`.
pub fn check_transition(
    loan: &Loan,
    action: Action,
    actor: Address,
    now: DateTime<Utc>,
    value: Option<Amount>,
) -> Result<LoanStatus, LoanError> {
    let invalid = |why: String| LoanError::InvalidState(format!("loan {}: {}", loan.id, why));

    if !action.is_payable() && value.is_some_and(|v| !v.is_zero()) {
        return Err(invalid(format!("{} does not accept a value", action)));
    }
    let sent = value.unwrap_or(Amount::ZERO);

    match (loan.status, action) {
        (LoanStatus::Requested, Action::Fund) => {
            if actor == loan.borrower {
                return Err(invalid("borrower cannot fund their own loan".to_string()));
            }
            if sent != loan.principal {
                return Err(invalid(format!(
                    "funding must equal the principal {} (sent {})",
                    loan.principal, sent
                )));
            }
            Ok(LoanStatus::Funded)
        }
        (LoanStatus::Funded, Action::Withdraw) => {
            if actor != loan.borrower {
                return Err(invalid("only the borrower can withdraw".to_string()));
            }
            Ok(LoanStatus::Withdrawn)
        }
        (LoanStatus::Withdrawn, Action::Repay) => {
            if actor != loan.borrower {
                return Err(invalid("only the borrower can repay".to_string()));
            }
            if sent != loan.repayment {
                return Err(invalid(format!(
                    "repayment must equal {} exactly (sent {})",
                    loan.repayment, sent
                )));
            }
            if loan.is_overdue(now) {
                return Err(LoanError::Expired(format!(
                    "loan {} was due {}",
                    loan.id, loan.due_date
                )));
            }
            Ok(LoanStatus::Repaid)
        }
        (LoanStatus::Withdrawn, Action::MarkDefault) => {
            if !loan.is_overdue(now) {
                return Err(LoanError::Expired(format!(
                    "loan {} is not past due until {}",
                    loan.id, loan.due_date
                )));
            }
            Ok(LoanStatus::Defaulted)
        }
        (status, action) => Err(invalid(format!("cannot {} a {} loan", action, status))),
    }
}

/// Whether `actor` may take `action` right now, assuming they send the exact
/// value the ledger requires.
pub fn can_transition(loan: &Loan, action: Action, actor: Address, now: DateTime<Utc>) -> bool {
    check_transition(loan, action, actor, now, loan.required_value(action)).is_ok()
}

pub fn available_actions(loan: &Loan, actor: Address, now: DateTime<Utc>) -> Vec<Action> {
    Action::ALL
        .into_iter()
        .filter(|action| can_transition(loan, *action, actor, now))
        .collect()
}

/// Parameters of a new loan request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoanRequest {
    pub principal: Amount,
    pub repayment: Amount,
    pub due_date: DateTime<Utc>,
}

/// Applies the ledger's creation guards locally.
pub fn validate_request(request: &LoanRequest, now: DateTime<Utc>) -> Result<(), LoanError> {
    if request.principal.is_zero() {
        return Err(LoanError::InvalidState("principal must be positive".to_string()));
    }
    if request.repayment <= request.principal {
        return Err(LoanError::InvalidState(format!(
            "repayment {} must exceed principal {}",
            request.repayment, request.principal
        )));
    }
    if request.due_date <= now {
        return Err(LoanError::Expired(format!(
            "due date {} must be in the future",
            request.due_date
        )));
    }
    if request.due_date > now + chrono::Duration::days(MAX_TERM_DAYS) {
        return Err(LoanError::Expired(format!(
            "due date {} is more than {} days away",
            request.due_date, MAX_TERM_DAYS
        )));
    }
    Ok(())
}

/// Repayment a borrower would owe at `rate_bps` basis points of interest.
///
/// Preview only: once the loan exists the ledger's stored repayment wins.
pub fn preview_repayment(principal: Amount, rate_bps: u32) -> Option<Amount> {
    let interest = principal
        .base_units()
        .checked_mul(rate_bps as u128)?
        / 10_000;
    principal.checked_add(Amount::from_base_units(interest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = n;
        Address::from_bytes(bytes)
    }

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn loan(status: LoanStatus) -> Loan {
        Loan {
            id: 7,
            borrower: addr(1),
            lender: (status != LoanStatus::Requested).then_some(addr(2)),
            principal: Amount::from_base_units(5000),
            repayment: Amount::from_base_units(5500),
            due_date: t(1_000),
            status,
        }
    }

    fn raw(status: u32, lender: &str) -> RawLoanRecord {
        RawLoanRecord {
            id: 3,
            borrower: addr(1).to_string(),
            lender: lender.to_string(),
            principal: "5000".to_string(),
            repayment: "5500".to_string(),
            due_date: 1_700_000_000,
            status,
        }
    }

    #[test]
    fn normalize_treats_zero_lender_as_absent() {
        let loan = normalize(raw(0, &Address::ZERO.to_string())).unwrap();
        assert_eq!(loan.status, LoanStatus::Requested);
        assert_eq!(loan.lender, None);
        assert_eq!(loan.due_date.timestamp(), 1_700_000_000);
    }

    #[test]
    fn normalize_rejects_invariant_violations() {
        let lender = addr(2).to_string();
        assert!(normalize(raw(0, &lender)).is_err());
        assert!(normalize(raw(1, "")).is_err());
        assert!(normalize(raw(9, &lender)).is_err());

        let mut bad = raw(1, &lender);
        bad.repayment = "5000".to_string();
        let err = normalize(bad).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::MalformedRecord);
    }

    #[test]
    fn status_labels_cover_unknown_codes() {
        assert_eq!(status_label(2), "Withdrawn");
        assert_eq!(status_label(42), "Unknown");
        for code in 0..5 {
            assert_eq!(LoanStatus::from_code(code).unwrap().code(), code);
        }
    }

    #[test]
    fn derived_fields() {
        let l = loan(LoanStatus::Withdrawn);
        assert_eq!(l.interest(), Amount::from_base_units(500));
        assert!((l.interest_rate() - 0.1).abs() < 1e-12);
        assert_eq!(l.interest_rate_percent(), 10);
        assert_eq!(l.progress(), 0);
        assert_eq!(loan(LoanStatus::Repaid).progress(), 100);
    }

    #[test]
    fn fund_requires_non_borrower_and_exact_principal() {
        let l = loan(LoanStatus::Requested);
        let exact = Some(Amount::from_base_units(5000));
        assert_eq!(
            check_transition(&l, Action::Fund, addr(2), t(0), exact).unwrap(),
            LoanStatus::Funded
        );
        assert!(check_transition(&l, Action::Fund, addr(1), t(0), exact).is_err());
        let short = check_transition(&l, Action::Fund, addr(2), t(0), Some(Amount::from_base_units(4000)));
        assert_eq!(short.unwrap_err().kind(), crate::error::ErrorKind::InvalidState);
        assert!(check_transition(&l, Action::Fund, addr(2), t(0), None).is_err());
    }

    #[test]
    fn withdraw_is_borrower_only() {
        let l = loan(LoanStatus::Funded);
        assert!(check_transition(&l, Action::Withdraw, addr(2), t(0), None).is_err());
        assert_eq!(
            check_transition(&l, Action::Withdraw, addr(1), t(0), None).unwrap(),
            LoanStatus::Withdrawn
        );
        assert!(check_transition(&l, Action::Withdraw, addr(1), t(0), Some(Amount::from_base_units(1))).is_err());
    }

    #[test]
    fn repay_needs_exact_value_before_due_date() {
        let l = loan(LoanStatus::Withdrawn);
        let exact = Some(Amount::from_base_units(5500));
        assert_eq!(
            check_transition(&l, Action::Repay, addr(1), t(1_000), exact).unwrap(),
            LoanStatus::Repaid
        );
        let short = check_transition(&l, Action::Repay, addr(1), t(0), Some(Amount::from_base_units(5499)));
        assert_eq!(short.unwrap_err().kind(), crate::error::ErrorKind::InvalidState);
        let late = check_transition(&l, Action::Repay, addr(1), t(1_001), exact);
        assert_eq!(late.unwrap_err().kind(), crate::error::ErrorKind::Expired);
    }

    #[test]
    fn default_only_after_due_date_by_anyone() {
        let l = loan(LoanStatus::Withdrawn);
        let early = check_transition(&l, Action::MarkDefault, addr(9), t(1_000), None);
        assert_eq!(early.unwrap_err().kind(), crate::error::ErrorKind::Expired);
        assert_eq!(
            check_transition(&l, Action::MarkDefault, addr(9), t(1_001), None).unwrap(),
            LoanStatus::Defaulted
        );
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for status in [LoanStatus::Repaid, LoanStatus::Defaulted] {
            let l = loan(status);
            for actor in [addr(1), addr(2), addr(9)] {
                assert!(available_actions(&l, actor, t(5_000)).is_empty());
            }
        }
    }

    #[test]
    fn available_actions_follow_the_table() {
        assert_eq!(
            available_actions(&loan(LoanStatus::Requested), addr(2), t(0)),
            vec![Action::Fund]
        );
        assert!(available_actions(&loan(LoanStatus::Requested), addr(1), t(0)).is_empty());
        assert_eq!(
            available_actions(&loan(LoanStatus::Withdrawn), addr(1), t(0)),
            vec![Action::Repay]
        );
        assert_eq!(
            available_actions(&loan(LoanStatus::Withdrawn), addr(1), t(2_000)),
            vec![Action::MarkDefault]
        );
    }

    #[test]
    fn request_guards() {
        let now = t(0);
        let ok = LoanRequest {
            principal: Amount::from_base_units(5000),
            repayment: Amount::from_base_units(5500),
            due_date: now + chrono::Duration::days(30),
        };
        assert!(validate_request(&ok, now).is_ok());

        let flat = LoanRequest { repayment: ok.principal, ..ok };
        assert_eq!(
            validate_request(&flat, now).unwrap_err().kind(),
            crate::error::ErrorKind::InvalidState
        );
        let past = LoanRequest { due_date: now, ..ok };
        assert_eq!(
            validate_request(&past, now).unwrap_err().kind(),
            crate::error::ErrorKind::Expired
        );
        let far = LoanRequest {
            due_date: now + chrono::Duration::days(MAX_TERM_DAYS + 1),
            ..ok
        };
        assert!(validate_request(&far, now).is_err());
    }

    #[test]
    fn repayment_preview_uses_basis_points() {
        let principal = Amount::from_base_units(5000);
        assert_eq!(preview_repayment(principal, 1_000), Some(Amount::from_base_units(5500)));
        assert_eq!(preview_repayment(principal, 0), Some(principal));
    }
}
