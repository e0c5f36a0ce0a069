//! Structured field extraction from OCR text
//!
//! A fixed, ordered registry of pure rules. Each rule looks for one field and
//! never sees the others' results, so adding a rule cannot change what the
//! existing ones find.

pub mod rules;

use crate::ocr::OcrOutcome;
use crate::types::{ClassificationResult, DocumentType, ExtractedFields, PaymentStatusKeyword};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tracing::debug;

/// One field found by a rule
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Amount(f64),
    Date(NaiveDate),
    TransactionRef(String),
    Platform(String),
    BankName(String),
    Status(PaymentStatusKeyword),
    PaymentKeyword,
}

/// Pure extraction rule
pub type ExtractionRule = fn(&str) -> Option<Field>;

/// Rule registry, applied in order
pub const RULES: &[(&str, ExtractionRule)] = &[
    ("amount", rules::amount),
    ("date", rules::date),
    ("transaction_ref", rules::transaction_ref),
    ("platform", rules::platform),
    ("bank_name", rules::bank_name),
    ("status_keyword", rules::status_keyword),
    ("payment_keyword", rules::payment_keyword),
];

/// Which OCR text the extractor reads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionSource {
    /// Winner text only
    #[default]
    Winner,
    /// Winner text followed by the runner-up's text
    Combined,
}

impl ExtractionSource {
    /// Text to extract from; empty when no engine produced usable text
    pub fn source_text<'a>(&self, outcome: &'a OcrOutcome) -> Cow<'a, str> {
        match (self, outcome.runner_up()) {
            (ExtractionSource::Combined, Some(other)) => {
                Cow::Owned(format!("{}\n{}", outcome.winner_text(), other.text))
            }
            _ => Cow::Borrowed(outcome.winner_text()),
        }
    }
}

/// Apply every rule to `text`
pub fn extract_fields(text: &str) -> ExtractedFields {
    let mut fields = ExtractedFields::default();
    if text.trim().is_empty() {
        return fields;
    }

    for (name, rule) in RULES {
        let Some(found) = rule(text) else {
            continue;
        };
        debug!(rule = name, field = ?found, "Field extracted");
        match found {
            Field::Amount(amount) => {
                fields.amount = Some(amount);
                fields.has_amount = true;
            }
            Field::Date(date) => {
                fields.date = Some(date);
                fields.has_date = true;
            }
            Field::TransactionRef(reference) => {
                fields.transaction_ref = Some(reference);
                fields.has_transaction_ref = true;
            }
            Field::Platform(platform) => fields.platform = Some(platform),
            Field::BankName(bank) => {
                fields.bank_name = Some(bank);
                fields.has_bank_name = true;
            }
            Field::Status(status) => {
                fields.status_keyword = Some(status);
                fields.has_status_keyword = true;
            }
            Field::PaymentKeyword => fields.has_payment_keyword = true,
        }
    }

    fields
}

/// Payment type reported to callers (`UPI`, `BANK_TRANSFER`, `CHEQUE`, `CASH`)
///
/// A payment classification decides; otherwise the platform vocabulary does.
pub fn payment_type(
    fields: &ExtractedFields,
    classification: &ClassificationResult,
) -> Option<&'static str> {
    let from_classification = match classification.document_type {
        DocumentType::UpiConfirmation => Some("UPI"),
        DocumentType::BankTransferConfirmation => Some("BANK_TRANSFER"),
        DocumentType::ChequeImage => Some("CHEQUE"),
        DocumentType::CashReceipt => Some("CASH"),
        DocumentType::NonPaymentDocument | DocumentType::Unclear => None,
    };

    from_classification.or_else(|| {
        let platform = fields.platform.as_deref()?;
        if rules::is_upi_platform(platform) {
            Some("UPI")
        } else if rules::is_bank_transfer_platform(platform) {
            Some("BANK_TRANSFER")
        } else {
            None
        }
    })
}
