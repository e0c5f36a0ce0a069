//! Pure extraction rules
//!
//! Each rule scans OCR text for one signal and knows nothing about the others.
//! Patterns are compiled once and shared.

use super::Field;
use crate::types::PaymentStatusKeyword;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

/// Upper bound for a plausible maintenance payment; longer digit runs are references
const MAX_AMOUNT: f64 = 10_000_000.0;

fn compile(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => panic!("invalid built-in pattern {pattern:?}: {e}"),
    }
}

// ============================================================================
// Amount
// ============================================================================

static CURRENCY_AMOUNT: Lazy<Regex> =
    Lazy::new(|| compile(r"(?i)(?:₹|\brs\.?|\binr)\s*([0-9][0-9,]*(?:\.[0-9]{1,2})?)"));

static LABELLED_AMOUNT: Lazy<Regex> = Lazy::new(|| {
    compile(r"(?i)\b(?:amount|amt|total)\b[^0-9\n]{0,12}([0-9][0-9,]*(?:\.[0-9]{1,2})?)")
});

/// Currency amounts: `₹5,000`, `Rs. 1,20,000.50`, `INR 750`, `Amount: 2500`
pub fn amount(text: &str) -> Option<Field> {
    [&*CURRENCY_AMOUNT, &*LABELLED_AMOUNT]
        .into_iter()
        .flat_map(|re| re.captures_iter(text))
        .filter_map(|cap| parse_amount(&cap[1]))
        .next()
        .map(Field::Amount)
}

fn parse_amount(raw: &str) -> Option<f64> {
    let value: f64 = raw.replace(',', "").parse().ok()?;
    (value > 0.0 && value < MAX_AMOUNT).then_some(value)
}

// ============================================================================
// Date
// ============================================================================

static ISO_DATE: Lazy<Regex> = Lazy::new(|| compile(r"\b(\d{4})-(\d{2})-(\d{2})(?:\b|T)"));

static NUMERIC_DATE: Lazy<Regex> =
    Lazy::new(|| compile(r"\b(\d{1,2})[/.\-](\d{1,2})[/.\-](\d{4}|\d{2})\b"));

static DAY_MONTH_NAME: Lazy<Regex> = Lazy::new(|| {
    compile(r"(?i)\b(\d{1,2})(?:st|nd|rd|th)?[\s\-]+([a-z]{3,9})\.?[,\s\-]+(\d{4})\b")
});

static MONTH_NAME_DAY: Lazy<Regex> =
    Lazy::new(|| compile(r"(?i)\b([a-z]{3,9})\.?\s+(\d{1,2})(?:st|nd|rd|th)?,?\s+(\d{4})\b"));

const MONTHS: [&str; 12] = [
    "january", "february", "march", "april", "may", "june", "july", "august", "september",
    "october", "november", "december",
];

fn month_from_name(name: &str) -> Option<u32> {
    let lower = name.to_ascii_lowercase();
    if lower == "sept" {
        return Some(9);
    }
    if lower.len() < 3 {
        return None;
    }
    MONTHS
        .iter()
        .position(|full| full.starts_with(&lower))
        .map(|idx| idx as u32 + 1)
}

fn make_date(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    if !(2000..=2100).contains(&year) {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

fn expand_year(raw: &str) -> Option<i32> {
    let year: i32 = raw.parse().ok()?;
    Some(if raw.len() == 2 { 2000 + year } else { year })
}

/// Dates in common Indian and international layouts
///
/// Numeric dates are read day-first; month-first is tried only when day-first
/// is impossible (e.g. `03/25/2024`).
pub fn date(text: &str) -> Option<Field> {
    let iso = ISO_DATE.captures_iter(text).find_map(|cap| {
        make_date(cap[1].parse().ok()?, cap[2].parse().ok()?, cap[3].parse().ok()?)
    });

    let numeric = || {
        NUMERIC_DATE.captures_iter(text).find_map(|cap| {
            let a: u32 = cap[1].parse().ok()?;
            let b: u32 = cap[2].parse().ok()?;
            let year = expand_year(&cap[3])?;
            make_date(year, b, a).or_else(|| make_date(year, a, b))
        })
    };

    let day_month = || {
        DAY_MONTH_NAME.captures_iter(text).find_map(|cap| {
            let day: u32 = cap[1].parse().ok()?;
            let month = month_from_name(&cap[2])?;
            make_date(cap[3].parse().ok()?, month, day)
        })
    };

    let month_day = || {
        MONTH_NAME_DAY.captures_iter(text).find_map(|cap| {
            let month = month_from_name(&cap[1])?;
            let day: u32 = cap[2].parse().ok()?;
            make_date(cap[3].parse().ok()?, month, day)
        })
    };

    iso.or_else(numeric)
        .or_else(day_month)
        .or_else(month_day)
        .map(Field::Date)
}

// ============================================================================
// Transaction reference
// ============================================================================

static REFERENCE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Bank UTR (NEFT 16-22 alphanumeric, IMPS/UPI 12 digits)
        r"(?i)\bUTR\b(?:\s*(?:no\.?|number|#))?\s*[:\-]?\s*([A-Z0-9]{12,22})\b",
        // UPI apps: "UPI Ref No", "UPI transaction ID"
        r"(?i)\bUPI\s*(?:ref(?:erence)?|txn|transaction)\.?\s*(?:id|no\.?|number)?\s*[:\-]?\s*([0-9]{12})\b",
        // Generic transaction ids
        r"(?i)\b(?:transaction|txn)\s*(?:id|ref(?:erence)?|no\.?|number)\s*[:\-]?\s*([A-Z0-9]{8,35})\b",
        // Bank transfer references
        r"(?i)\b(?:IMPS|NEFT|RTGS)\s*(?:ref(?:erence)?)?\s*(?:no\.?)?\s*[:\-/]?\s*([A-Z0-9]{10,22})\b",
        // Reference / RRN labels
        r"(?i)\b(?:ref(?:erence)?|rrn)\s*(?:id|no\.?|number|#)?\s*[:\-]?\s*([A-Z0-9]{8,35})\b",
        // PhonePe transaction ids
        r"\b(T[0-9]{20,24})\b",
    ]
    .into_iter()
    .map(compile)
    .collect()
});

fn plausible_reference(candidate: &str) -> bool {
    candidate.chars().filter(|c| c.is_ascii_digit()).count() >= 6
}

/// UTR / UPI / transaction references keyed by platform vocabulary
pub fn transaction_ref(text: &str) -> Option<Field> {
    REFERENCE_PATTERNS
        .iter()
        .flat_map(|re| re.captures_iter(text))
        .map(|cap| cap[1].to_ascii_uppercase())
        .find(|candidate| plausible_reference(candidate))
        .map(Field::TransactionRef)
}

// ============================================================================
// Platform and bank
// ============================================================================

static PLATFORMS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("Google Pay", r"(?i)\b(?:google\s*pay|gpay|g\s+pay)\b"),
        ("PhonePe", r"(?i)\bphone\s*pe\b"),
        ("Paytm", r"(?i)\bpaytm\b"),
        ("BHIM", r"(?i)\bbhim\b"),
        ("Amazon Pay", r"(?i)\bamazon\s*pay\b"),
        ("CRED", r"\bCRED\b"),
        ("WhatsApp Pay", r"(?i)\bwhatsapp\s*pay\b"),
        ("NEFT", r"(?i)\bneft\b"),
        ("IMPS", r"(?i)\bimps\b"),
        ("RTGS", r"(?i)\brtgs\b"),
        ("UPI", r"(?i)\bupi\b"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, compile(pattern)))
    .collect()
});

static BANKS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("State Bank of India", r"(?i)\b(?:sbi|state\s+bank\s+of\s+india)\b"),
        ("HDFC Bank", r"(?i)\bhdfc\b"),
        ("ICICI Bank", r"(?i)\bicici\b"),
        ("Axis Bank", r"(?i)\baxis\s*bank\b"),
        ("Kotak Mahindra Bank", r"(?i)\bkotak\b"),
        ("Punjab National Bank", r"(?i)\b(?:pnb|punjab\s+national\s+bank)\b"),
        ("Bank of Baroda", r"(?i)\bbank\s+of\s+baroda\b"),
        ("Canara Bank", r"(?i)\bcanara\b"),
        ("Union Bank of India", r"(?i)\bunion\s+bank\b"),
        ("IDFC First Bank", r"(?i)\bidfc\b"),
        ("Yes Bank", r"(?i)\byes\s*bank\b"),
        ("IndusInd Bank", r"(?i)\bindusind\b"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, compile(pattern)))
    .collect()
});

fn first_vocabulary_match(vocabulary: &[(&'static str, Regex)], text: &str) -> Option<String> {
    vocabulary
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(name, _)| name.to_string())
}

/// Payment platform; specific apps take precedence over the generic "UPI"
pub fn platform(text: &str) -> Option<Field> {
    first_vocabulary_match(&PLATFORMS, text).map(Field::Platform)
}

pub fn bank_name(text: &str) -> Option<Field> {
    first_vocabulary_match(&BANKS, text).map(Field::BankName)
}

/// Platforms that settle over UPI rails
pub fn is_upi_platform(platform: &str) -> bool {
    matches!(
        platform,
        "Google Pay" | "PhonePe" | "Paytm" | "BHIM" | "Amazon Pay" | "CRED" | "WhatsApp Pay" | "UPI"
    )
}

/// Platforms that are bank transfer rails
pub fn is_bank_transfer_platform(platform: &str) -> bool {
    matches!(platform, "NEFT" | "IMPS" | "RTGS")
}

// ============================================================================
// Keywords
// ============================================================================

static FAILED_STATUS: Lazy<Regex> =
    Lazy::new(|| compile(r"(?i)\b(?:failed|failure|declined|unsuccessful|rejected)\b"));

static PENDING_STATUS: Lazy<Regex> =
    Lazy::new(|| compile(r"(?i)\b(?:pending|processing|in\s+progress)\b"));

static SUCCESS_STATUS: Lazy<Regex> =
    Lazy::new(|| compile(r"(?i)\b(?:successful(?:ly)?|success|completed|approved|paid)\b"));

static PAYMENT_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    compile(r"(?i)\b(?:paid|payment|transferred|transfer|sent|received|debited|credited|transaction|txn)\b")
});

/// Status keyword; failure wording wins over success wording when both appear
pub fn status_keyword(text: &str) -> Option<Field> {
    let status = if FAILED_STATUS.is_match(text) {
        PaymentStatusKeyword::Failed
    } else if PENDING_STATUS.is_match(text) {
        PaymentStatusKeyword::Pending
    } else if SUCCESS_STATUS.is_match(text) {
        PaymentStatusKeyword::Success
    } else {
        return None;
    };
    Some(Field::Status(status))
}

pub fn payment_keyword(text: &str) -> Option<Field> {
    PAYMENT_KEYWORD.is_match(text).then_some(Field::PaymentKeyword)
}
