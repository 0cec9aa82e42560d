use chrono::NaiveDate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeStatus {
    Pending,
    Partial,
    Paid,
    Overdue,
}

impl FeeStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "partial" => Some(Self::Partial),
            "paid" => Some(Self::Paid),
            "overdue" => Some(Self::Overdue),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Partial => "partial",
            Self::Paid => "paid",
            Self::Overdue => "overdue",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMethod {
    Cash,
    Upi,
    BankTransfer,
}

impl PaymentMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cash" => Some(Self::Cash),
            "upi" => Some(Self::Upi),
            "bank_transfer" => Some(Self::BankTransfer),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cash => "cash",
            Self::Upi => "upi",
            Self::BankTransfer => "bank_transfer",
        }
    }

    /// Non-cash payments must carry a transaction reference.
    pub fn needs_transaction_id(self) -> bool {
        !matches!(self, Self::Cash)
    }
}

/// The one rule for fee status. Every fee write goes through here.
///
/// A fee due today is still pending; it turns overdue the day after.
pub fn derive_status(
    amount_minor: i64,
    paid_minor: i64,
    due_date: NaiveDate,
    as_of: NaiveDate,
) -> FeeStatus {
    if paid_minor >= amount_minor {
        FeeStatus::Paid
    } else if paid_minor > 0 {
        FeeStatus::Partial
    } else if due_date < as_of {
        FeeStatus::Overdue
    } else {
        FeeStatus::Pending
    }
}

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

/// Accepts `YYYY-MM-DD`, tolerating a trailing time part.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    let day = s.split('T').next().unwrap_or(s);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

pub fn format_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

/// Largest amount (in rupees) a single fee or payment may carry.
pub const MAX_AMOUNT: f64 = 1e12;

/// Rupees on the wire, paise in storage.
pub fn to_minor(amount: f64) -> Option<i64> {
    if !amount.is_finite() || !(0.0..=MAX_AMOUNT).contains(&amount) {
        return None;
    }
    Some((amount * 100.0).round() as i64)
}

pub fn from_minor(minor: i64) -> f64 {
    minor as f64 / 100.0
}

pub fn format_money(minor: i64, symbol: &str) -> String {
    let sign = if minor < 0 { "-" } else { "" };
    let abs = minor.abs();
    format!("{}{}{}.{:02}", sign, symbol, abs / 100, abs % 100)
}

/// Roll-up shown next to each student: all paid, some paid, overdue, or pending.
pub fn student_fee_summary<I>(statuses: I) -> &'static str
where
    I: IntoIterator<Item = FeeStatus>,
{
    let mut total = 0usize;
    let mut paid = 0usize;
    let mut partial = 0usize;
    let mut overdue = 0usize;
    for s in statuses {
        total += 1;
        match s {
            FeeStatus::Paid => paid += 1,
            FeeStatus::Partial => partial += 1,
            FeeStatus::Overdue => overdue += 1,
            FeeStatus::Pending => {}
        }
    }
    if total == 0 {
        "No Fees"
    } else if paid == total {
        "Paid"
    } else if paid > 0 || partial > 0 {
        "Partial"
    } else if overdue > 0 {
        "Overdue"
    } else {
        "Pending"
    }
}
