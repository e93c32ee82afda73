//! Shared types for the order intake pipeline.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::ExtractionError;

// ── Confirmation state ──────────────────────────────────────────────

/// Whether the submitting channel already confirmed the order.
///
/// Derived from keywords in the message subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfirmationState {
    Confirmed,
    #[default]
    PendingApproval,
}

impl ConfirmationState {
    /// Classify a subject line. Anything not explicitly confirmed waits for approval.
    pub fn from_subject(subject: &str) -> Self {
        let lower = subject.to_lowercase();
        let pending = ["pendiente", "pending", "por aprobar", "aprobación", "approval"];
        if pending.iter().any(|k| lower.contains(k)) {
            return Self::PendingApproval;
        }
        if lower.contains("confirmad") || lower.contains("confirmed") {
            Self::Confirmed
        } else {
            Self::PendingApproval
        }
    }

    /// Workflow state recorded on the order's first audit entry.
    pub fn initial_workflow_state(&self) -> &'static str {
        match self {
            Self::Confirmed => "in_review",
            Self::PendingApproval => "pending_credit_approval",
        }
    }
}

impl std::fmt::Display for ConfirmationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Confirmed => "CONFIRMED",
            Self::PendingApproval => "PENDING_APPROVAL",
        };
        write!(f, "{s}")
    }
}

// ── Extracted data ──────────────────────────────────────────────────

/// Customer header fields, captured verbatim and trimmed only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerHeader {
    pub tax_id: String,
    pub legal_name: String,
    pub address: String,
    pub district: String,
    pub shipment_type: String,
    pub carrier: String,
}

/// One product row from the order document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedLineItem {
    /// Original casing, kept for display.
    pub sku: String,
    pub description: String,
    pub quantity: u32,
    pub unit_price: Decimal,
}

impl ExtractedLineItem {
    /// SKU normalized for matching.
    pub fn folded_sku(&self) -> String {
        fold_sku(&self.sku)
    }

    pub fn line_total(&self) -> Decimal {
        Decimal::from(self.quantity) * self.unit_price
    }
}

/// Case-fold a SKU for matching.
pub fn fold_sku(sku: &str) -> String {
    sku.trim().to_uppercase()
}

/// Normalize a tax id for matching: dots and whitespace removed, verifier upper-cased.
pub fn normalize_tax_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && *c != '.')
        .collect::<String>()
        .to_uppercase()
}

// ── Validation ──────────────────────────────────────────────────────

/// Overall classification of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    Valid,
    Warning,
    Error,
}

/// Category of an advisory attached to a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryKind {
    ExtractionError,
    FieldMissing,
    ReconciliationMiss,
    DuplicateConflict,
    ExactDuplicate,
}

/// Human-readable note explaining part of a validation outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advisory {
    pub kind: AdvisoryKind,
    pub message: String,
}

impl Advisory {
    pub fn new(kind: AdvisoryKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Advisory for a field no source carried.
    pub fn field_missing(field: &str) -> Self {
        let error = ExtractionError::FieldMissing {
            field: field.to_string(),
        };
        Self::new(AdvisoryKind::FieldMissing, error.to_string())
    }
}

/// Resolution result for one extracted line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedLine {
    pub sku: String,
    pub resolved_product_id: Option<String>,
}

/// Outcome of reconciling a candidate against the reference store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub status: ValidationStatus,
    pub advisories: Vec<Advisory>,
    pub resolved_customer_id: Option<String>,
    pub resolved_line_items: Vec<ResolvedLine>,
    pub default_selected: bool,
}

impl ValidationOutcome {
    /// Outcome for a candidate that could not be extracted at all.
    pub fn failed(advisories: Vec<Advisory>) -> Self {
        Self {
            status: ValidationStatus::Error,
            advisories,
            resolved_customer_id: None,
            resolved_line_items: Vec::new(),
            default_selected: false,
        }
    }
}

// ── Duplicates ──────────────────────────────────────────────────────

/// Relation of a candidate to orders that already exist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DuplicateStatus {
    /// No order with this origin code exists.
    #[default]
    New,
    /// Same reference number, customer and total as an existing order.
    ExactDuplicate { existing_order_id: Option<String> },
    /// Same origin code but different content.
    Conflict { existing_order_id: Option<String> },
}

impl DuplicateStatus {
    pub fn is_exact(&self) -> bool {
        matches!(self, Self::ExactDuplicate { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

// ── Totals ──────────────────────────────────────────────────────────

/// Monetary totals of an order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotals {
    pub net: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
}

impl OrderTotals {
    /// `net = Σ qty × price`, `tax = net × rate` (2 dp), `total = net + tax`.
    pub fn compute<'a>(
        lines: impl IntoIterator<Item = &'a ExtractedLineItem>,
        tax_rate: Decimal,
    ) -> Self {
        let net: Decimal = lines.into_iter().map(ExtractedLineItem::line_total).sum();
        let tax = (net * tax_rate).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        Self {
            net,
            tax,
            total: net + tax,
        }
    }
}

// ── Candidate order ─────────────────────────────────────────────────

/// An order parsed from one message, not yet persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateOrder {
    pub origin_code: String,
    /// Set only for conflicting resubmissions.
    pub alternate_origin_code: Option<String>,
    /// Mailbox handle the candidate was decoded from.
    pub message_handle: Option<String>,
    pub message_date: DateTime<Utc>,
    pub confirmation_state: ConfirmationState,
    /// Taken from the covering message body only.
    pub internal_reference_number: Option<String>,
    pub archived_document_path: Option<String>,
    pub header: CustomerHeader,
    pub line_items: Vec<ExtractedLineItem>,
    pub validation: ValidationOutcome,
    pub duplicate: DuplicateStatus,
    /// Raw attachment bytes, kept in-process for archiving at commit.
    #[serde(skip)]
    pub document: Option<Vec<u8>>,
}

impl CandidateOrder {
    /// Code the order is persisted under.
    pub fn effective_origin_code(&self) -> &str {
        self.alternate_origin_code
            .as_deref()
            .unwrap_or(&self.origin_code)
    }

    /// Lines whose product resolved.
    pub fn resolved_lines(&self) -> impl Iterator<Item = &ExtractedLineItem> {
        self.line_items
            .iter()
            .zip(self.validation.resolved_line_items.iter())
            .filter(|(_, r)| r.resolved_product_id.is_some())
            .map(|(item, _)| item)
    }

    /// Totals over resolved lines only.
    pub fn totals(&self, tax_rate: Decimal) -> OrderTotals {
        OrderTotals::compute(self.resolved_lines(), tax_rate)
    }
}

/// A candidate approved for commit.
///
/// Mirrors the reviewable fields of [`CandidateOrder`]; validation results are
/// recomputed at commit time rather than trusted from the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateInput {
    pub origin_code: String,
    #[serde(default)]
    pub alternate_origin_code: Option<String>,
    #[serde(default)]
    pub message_handle: Option<String>,
    pub message_date: DateTime<Utc>,
    #[serde(default)]
    pub confirmation_state: ConfirmationState,
    #[serde(default)]
    pub internal_reference_number: Option<String>,
    pub header: CustomerHeader,
    #[serde(default)]
    pub line_items: Vec<ExtractedLineItem>,
    #[serde(skip)]
    pub document: Option<Vec<u8>>,
}

impl CandidateInput {
    pub fn effective_origin_code(&self) -> &str {
        self.alternate_origin_code
            .as_deref()
            .unwrap_or(&self.origin_code)
    }
}

impl From<&CandidateOrder> for CandidateInput {
    fn from(candidate: &CandidateOrder) -> Self {
        Self {
            origin_code: candidate.origin_code.clone(),
            alternate_origin_code: candidate.alternate_origin_code.clone(),
            message_handle: candidate.message_handle.clone(),
            message_date: candidate.message_date,
            confirmation_state: candidate.confirmation_state,
            internal_reference_number: candidate.internal_reference_number.clone(),
            header: candidate.header.clone(),
            line_items: candidate.line_items.clone(),
            document: candidate.document.clone(),
        }
    }
}

/// Structured per-candidate failure, reported instead of propagated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateError {
    pub origin_code: Option<String>,
    pub message_handle: Option<String>,
    /// Where processing stopped, e.g. `fetch`, `decode`, `resolving_customer`.
    pub stage: String,
    pub message: String,
}

impl CandidateError {
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            origin_code: None,
            message_handle: None,
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn for_order(mut self, origin_code: &str) -> Self {
        if !origin_code.is_empty() {
            self.origin_code = Some(origin_code.to_string());
        }
        self
    }

    pub fn for_message(mut self, handle: Option<&str>) -> Self {
        self.message_handle = handle.map(str::to_string);
        self
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn item(sku: &str, qty: u32, price: Decimal) -> ExtractedLineItem {
        ExtractedLineItem {
            sku: sku.into(),
            description: String::new(),
            quantity: qty,
            unit_price: price,
        }
    }

    #[test]
    fn confirmation_from_subject() {
        assert_eq!(
            ConfirmationState::from_subject("Orden de compra CONFIRMADA OC-1"),
            ConfirmationState::Confirmed
        );
        assert_eq!(
            ConfirmationState::from_subject("Order confirmed"),
            ConfirmationState::Confirmed
        );
        assert_eq!(
            ConfirmationState::from_subject("Orden pendiente de aprobación"),
            ConfirmationState::PendingApproval
        );
        assert_eq!(
            ConfirmationState::from_subject("Nueva orden"),
            ConfirmationState::PendingApproval
        );
    }

    #[test]
    fn initial_workflow_states() {
        assert_eq!(ConfirmationState::Confirmed.initial_workflow_state(), "in_review");
        assert_eq!(
            ConfirmationState::PendingApproval.initial_workflow_state(),
            "pending_credit_approval"
        );
    }

    #[test]
    fn totals_follow_tax_rate() {
        let lines = vec![item("ABC123", 2, dec!(1000))];
        let totals = OrderTotals::compute(&lines, dec!(0.19));
        assert_eq!(totals.net, dec!(2000));
        assert_eq!(totals.tax, dec!(380));
        assert_eq!(totals.total, dec!(2380));
    }

    #[test]
    fn tax_rounds_to_cents() {
        let lines = vec![item("X", 1, dec!(0.05))];
        let totals = OrderTotals::compute(&lines, dec!(0.19));
        assert_eq!(totals.tax, dec!(0.01));
        assert_eq!(totals.total, totals.net + totals.tax);
    }

    #[test]
    fn sku_and_tax_id_normalization() {
        assert_eq!(fold_sku(" abc123 "), "ABC123");
        assert_eq!(normalize_tax_id("77.337.586-k"), "77337586-K");
    }

    #[test]
    fn confirmation_state_serializes_screaming() {
        let json = serde_json::to_value(ConfirmationState::PendingApproval).unwrap();
        assert_eq!(json, "PENDING_APPROVAL");
    }
}
