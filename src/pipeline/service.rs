//! The exposed operations: `preview` (read-only) and `commit`.
//!
//! Both return a structured response even under partial failure. Only an
//! unreachable mailbox or reference store turns `success` false.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::archive::Archiver;
use crate::config::IntakeConfig;
use crate::error::DatabaseError;
use crate::mailbox::{MailSource, MailboxLocator, SearchCriteria, decode_message};
use crate::pipeline::cache::LookupCache;
use crate::pipeline::candidate::CandidateAssembler;
use crate::pipeline::commit::{
    CommitOptions, CommitOrchestrator, CommitReport, CreatedCustomer, CreatedOrder, CreatedProduct,
    SkippedOrder,
};
use crate::pipeline::duplicates::{DuplicateCheck, DuplicateDetector, OrderFingerprint};
use crate::pipeline::preview::{CandidateReport, PreviewBuilder, PreviewReport, PreviewSummary};
use crate::pipeline::reconcile::{Resolver, classify};
use crate::pipeline::rules::FieldRules;
use crate::pipeline::types::{CandidateError, CandidateInput, CandidateOrder};
use crate::store::ReferenceStore;

/// Result of a preview run.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewResponse {
    pub success: bool,
    pub message: String,
    pub candidates: Vec<CandidateReport>,
    pub summary: PreviewSummary,
    pub errors: Vec<CandidateError>,
}

/// Result of a commit run.
#[derive(Debug, Clone, Serialize)]
pub struct CommitResponse {
    pub success: bool,
    pub message: String,
    pub created: Vec<CreatedOrder>,
    pub skipped: Vec<SkippedOrder>,
    pub customers_created: Vec<CreatedCustomer>,
    pub products_created: Vec<CreatedProduct>,
    pub errors: Vec<CandidateError>,
}

impl From<CommitReport> for CommitResponse {
    fn from(report: CommitReport) -> Self {
        let message = match &report.aborted {
            Some(reason) => format!("commit aborted: {reason}"),
            None => format!(
                "{} created, {} skipped, {} failed",
                report.created.len(),
                report.skipped.len(),
                report.errors.len()
            ),
        };
        Self {
            success: report.aborted.is_none(),
            message,
            created: report.created,
            skipped: report.skipped,
            customers_created: report.customers_created,
            products_created: report.products_created,
            errors: report.errors,
        }
    }
}

/// Wires the mailbox, extraction, reconciliation and persistence stages.
pub struct IntakeService {
    locator: Arc<dyn MailboxLocator>,
    source: Arc<dyn MailSource>,
    store: Arc<dyn ReferenceStore>,
    archiver: Archiver,
    rules: FieldRules,
    config: IntakeConfig,
}

impl IntakeService {
    pub fn new(
        locator: Arc<dyn MailboxLocator>,
        source: Arc<dyn MailSource>,
        store: Arc<dyn ReferenceStore>,
        config: IntakeConfig,
    ) -> Self {
        Self {
            locator,
            source,
            store,
            archiver: Archiver::new(config.archive_dir.clone()),
            rules: FieldRules::default_rules(),
            config,
        }
    }

    /// Replace the default field rules.
    pub fn with_rules(mut self, rules: FieldRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn config(&self) -> &IntakeConfig {
        &self.config
    }

    /// Locate, extract, reconcile and classify. Writes nothing.
    pub async fn preview(
        &self,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    ) -> PreviewResponse {
        let criteria = SearchCriteria::new(&self.config.sender, &self.config.subject_filter)
            .with_range(date_from, date_to);
        let window_start = window_start(&criteria);
        let builder = PreviewBuilder::new(self.config.tax_rate);

        let handles = match self.locator.locate(&criteria).await {
            Ok(handles) => handles,
            Err(e) => {
                warn!(error = %e, "Mailbox search failed");
                return PreviewResponse::aborted(
                    format!("mailbox unavailable: {e}"),
                    builder.build(&[]),
                    Vec::new(),
                );
            }
        };
        info!(count = handles.len(), from = %window_start.date_naive(), "Located order messages");

        let cache = LookupCache::new(self.config.cache_ttl);
        let resolver = Resolver::new(self.store.as_ref(), &cache);
        let mut detector = DuplicateDetector::new(self.store.as_ref());
        let assembler = CandidateAssembler::new(&self.rules, self.config.number_locale);

        let mut candidates = Vec::with_capacity(handles.len());
        let mut errors = Vec::new();

        for handle in &handles {
            let raw = match self.source.fetch_raw(handle).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(handle = %handle, error = %e, "Failed to fetch message");
                    errors.push(
                        CandidateError::new("fetch", e.to_string()).for_message(Some(handle.as_str())),
                    );
                    continue;
                }
            };

            let mut candidate = match decode_message(handle, &raw) {
                Ok(message) => assembler.assemble(&message, window_start),
                Err(e) => {
                    warn!(handle = %handle, error = %e, "Failed to decode message");
                    errors.push(
                        CandidateError::new("decode", e.to_string()).for_message(Some(handle.as_str())),
                    );
                    CandidateAssembler::unreadable(handle, window_start, &e.to_string())
                }
            };

            if let Err(e) = self.reconcile(&resolver, &mut detector, &mut candidate).await {
                warn!(handle = %handle, error = %e, "Reconciliation failed");
                errors.push(
                    CandidateError::new("reconcile", e.to_string())
                        .for_order(&candidate.origin_code)
                        .for_message(Some(handle.as_str())),
                );
                if e.is_unavailable() {
                    candidates.push(candidate);
                    return PreviewResponse::aborted(
                        format!("reference store unavailable: {e}"),
                        builder.build(&candidates),
                        errors,
                    );
                }
            }
            candidates.push(candidate);
        }

        let report = builder.build(&candidates);
        info!(
            total = report.summary.total,
            valid = report.summary.valid,
            warning = report.summary.warning,
            error = report.summary.error,
            "Preview complete"
        );
        PreviewResponse {
            success: true,
            message: format!("{} candidate(s) found", report.summary.total),
            candidates: report.candidates,
            summary: report.summary,
            errors,
        }
    }

    /// Persist the approved candidates, one unit of work each.
    pub async fn commit(
        &self,
        inputs: &[CandidateInput],
        allow_create_customers: bool,
        allow_create_products: bool,
    ) -> CommitResponse {
        let cache = LookupCache::new(self.config.cache_ttl);
        let options = CommitOptions {
            allow_create_customers,
            allow_create_products,
        };
        let orchestrator = CommitOrchestrator::new(
            self.store.as_ref(),
            &cache,
            self.config.tax_rate,
            self.config.actor.clone(),
            options,
        )
        .with_archiver(&self.archiver)
        .with_mail_source(self.source.as_ref());

        orchestrator.commit_batch(inputs).await.into()
    }

    async fn reconcile(
        &self,
        resolver: &Resolver<'_>,
        detector: &mut DuplicateDetector<'_>,
        candidate: &mut CandidateOrder,
    ) -> Result<(), DatabaseError> {
        let extraction_advisories = candidate.validation.advisories.clone();
        let resolution = resolver.resolve(candidate).await?;

        candidate.validation.resolved_line_items = resolution.lines.clone();
        let fingerprint = OrderFingerprint {
            internal_reference_number: candidate.internal_reference_number.clone(),
            customer_id: resolution.customer_id.clone(),
            total: candidate.totals(self.config.tax_rate).total,
        };

        // Candidates that can never be committed do not claim their code.
        let check = if candidate.origin_code.is_empty() || candidate.line_items.is_empty() {
            DuplicateCheck::new_order()
        } else {
            detector
                .check_lenient(&candidate.origin_code, &fingerprint)
                .await?
        };
        candidate.duplicate = check.status;
        candidate.alternate_origin_code = check.alternate_origin_code;
        candidate.validation = classify(candidate, extraction_advisories, resolution);

        info!(
            origin_code = %candidate.origin_code,
            status = ?candidate.validation.status,
            selected = candidate.validation.default_selected,
            "Candidate classified"
        );
        Ok(())
    }
}

impl PreviewResponse {
    fn aborted(message: String, report: PreviewReport, errors: Vec<CandidateError>) -> Self {
        Self {
            success: false,
            message,
            candidates: report.candidates,
            summary: report.summary,
            errors,
        }
    }
}

/// Midnight UTC of the first day searched. Stands in for a missing `Date`.
fn window_start(criteria: &SearchCriteria) -> DateTime<Utc> {
    criteria
        .effective_from(Utc::now().date_naive())
        .and_time(NaiveTime::MIN)
        .and_utc()
}
