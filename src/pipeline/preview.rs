//! Preview report assembly. Pure: no I/O, no writes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::archive::Archiver;
use crate::pipeline::types::{
    Advisory, CandidateInput, CandidateOrder, ConfirmationState, CustomerHeader, DuplicateStatus,
    OrderTotals, ValidationStatus,
};

/// One line as shown for review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineReport {
    pub sku: String,
    pub description: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
    pub resolved_product_id: Option<String>,
}

/// Everything a reviewer needs to accept or reject one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateReport {
    pub origin_code: String,
    pub alternate_origin_code: Option<String>,
    pub message_handle: Option<String>,
    pub message_date: DateTime<Utc>,
    pub confirmation_state: ConfirmationState,
    pub internal_reference_number: Option<String>,
    pub header: CustomerHeader,
    pub resolved_customer_id: Option<String>,
    pub lines: Vec<LineReport>,
    /// Over resolved lines only.
    pub totals: OrderTotals,
    pub status: ValidationStatus,
    pub advisories: Vec<Advisory>,
    pub duplicate: DuplicateStatus,
    pub default_selected: bool,
    /// Where commit will archive the document, relative to the archive root.
    pub planned_archive_path: Option<String>,
    /// Ready to hand back to commit.
    pub input: CandidateInput,
}

/// Counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewSummary {
    pub total: usize,
    pub valid: usize,
    pub warning: usize,
    pub error: usize,
    pub selected: usize,
    pub exact_duplicates: usize,
    pub conflicts: usize,
}

/// The reviewable report over a batch of candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewReport {
    pub candidates: Vec<CandidateReport>,
    pub summary: PreviewSummary,
}

/// Builds preview reports.
pub struct PreviewBuilder {
    tax_rate: Decimal,
}

impl PreviewBuilder {
    pub fn new(tax_rate: Decimal) -> Self {
        Self { tax_rate }
    }

    /// Report over the candidates, in the given order.
    pub fn build(&self, candidates: &[CandidateOrder]) -> PreviewReport {
        let candidates: Vec<CandidateReport> = candidates.iter().map(|c| self.candidate(c)).collect();
        let summary = summarize(&candidates);
        PreviewReport {
            candidates,
            summary,
        }
    }

    pub fn candidate(&self, candidate: &CandidateOrder) -> CandidateReport {
        let lines = candidate
            .line_items
            .iter()
            .enumerate()
            .map(|(i, item)| LineReport {
                sku: item.sku.clone(),
                description: item.description.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price,
                line_total: item.line_total(),
                resolved_product_id: candidate
                    .validation
                    .resolved_line_items
                    .get(i)
                    .and_then(|r| r.resolved_product_id.clone()),
            })
            .collect();

        let planned_archive_path = candidate
            .document
            .as_ref()
            .filter(|_| !candidate.origin_code.is_empty())
            .and_then(|_| {
                Archiver::relative_path(candidate.effective_origin_code(), candidate.message_date).ok()
            });

        CandidateReport {
            origin_code: candidate.origin_code.clone(),
            alternate_origin_code: candidate.alternate_origin_code.clone(),
            message_handle: candidate.message_handle.clone(),
            message_date: candidate.message_date,
            confirmation_state: candidate.confirmation_state,
            internal_reference_number: candidate.internal_reference_number.clone(),
            header: candidate.header.clone(),
            resolved_customer_id: candidate.validation.resolved_customer_id.clone(),
            lines,
            totals: candidate.totals(self.tax_rate),
            status: candidate.validation.status,
            advisories: candidate.validation.advisories.clone(),
            duplicate: candidate.duplicate.clone(),
            default_selected: candidate.validation.default_selected,
            planned_archive_path,
            input: CandidateInput::from(candidate),
        }
    }
}

fn summarize(candidates: &[CandidateReport]) -> PreviewSummary {
    let mut summary = PreviewSummary {
        total: candidates.len(),
        ..Default::default()
    };
    for c in candidates {
        match c.status {
            ValidationStatus::Valid => summary.valid += 1,
            ValidationStatus::Warning => summary.warning += 1,
            ValidationStatus::Error => summary.error += 1,
        }
        if c.default_selected {
            summary.selected += 1;
        }
        if c.duplicate.is_exact() {
            summary.exact_duplicates += 1;
        }
        if c.duplicate.is_conflict() {
            summary.conflicts += 1;
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::pipeline::types::{ExtractedLineItem, ResolvedLine, ValidationOutcome};

    fn candidate() -> CandidateOrder {
        CandidateOrder {
            origin_code: "OC-1".into(),
            alternate_origin_code: None,
            message_handle: Some("3".into()),
            message_date: Utc.with_ymd_and_hms(2026, 3, 3, 14, 5, 0).unwrap(),
            confirmation_state: ConfirmationState::Confirmed,
            internal_reference_number: Some("884213".into()),
            archived_document_path: None,
            header: CustomerHeader::default(),
            line_items: vec![
                ExtractedLineItem {
                    sku: "ABC123".into(),
                    description: "Tornillo".into(),
                    quantity: 2,
                    unit_price: dec!(1000),
                },
                ExtractedLineItem {
                    sku: "ZZZ".into(),
                    description: String::new(),
                    quantity: 1,
                    unit_price: dec!(500),
                },
            ],
            validation: ValidationOutcome {
                status: ValidationStatus::Warning,
                advisories: Vec::new(),
                resolved_customer_id: Some("c1".into()),
                resolved_line_items: vec![
                    ResolvedLine {
                        sku: "ABC123".into(),
                        resolved_product_id: Some("p1".into()),
                    },
                    ResolvedLine {
                        sku: "ZZZ".into(),
                        resolved_product_id: None,
                    },
                ],
                default_selected: true,
            },
            duplicate: DuplicateStatus::New,
            document: Some(b"%PDF".to_vec()),
        }
    }

    #[test]
    fn totals_cover_resolved_lines_only() {
        let report = PreviewBuilder::new(dec!(0.19)).build(&[candidate()]);
        let c = &report.candidates[0];
        assert_eq!(c.totals.net, dec!(2000));
        assert_eq!(c.totals.tax, dec!(380));
        assert_eq!(c.totals.total, dec!(2380));
        assert_eq!(c.lines[1].resolved_product_id, None);
        assert_eq!(c.lines[1].line_total, dec!(500));
    }

    #[test]
    fn planned_path_uses_effective_code() {
        let mut c = candidate();
        c.alternate_origin_code = Some("OC-1-R".into());
        let report = PreviewBuilder::new(dec!(0.19)).build(&[c]);
        assert_eq!(
            report.candidates[0].planned_archive_path.as_deref(),
            Some("2026/03/OC-1-R_2026-03-03_14-05.pdf")
        );
        assert_eq!(report.candidates[0].input.effective_origin_code(), "OC-1-R");
    }

    #[test]
    fn building_twice_is_identical() {
        let builder = PreviewBuilder::new(dec!(0.19));
        let a = serde_json::to_value(builder.build(&[candidate()])).unwrap();
        let b = serde_json::to_value(builder.build(&[candidate()])).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn summary_counts() {
        let mut exact = candidate();
        exact.duplicate = DuplicateStatus::ExactDuplicate {
            existing_order_id: None,
        };
        exact.validation.default_selected = false;
        let report = PreviewBuilder::new(dec!(0.19)).build(&[candidate(), exact]);
        assert_eq!(report.summary.total, 2);
        assert_eq!(report.summary.warning, 2);
        assert_eq!(report.summary.selected, 1);
        assert_eq!(report.summary.exact_duplicates, 1);
    }
}
