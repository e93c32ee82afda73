//! Persists approved candidates one at a time.
//!
//! Each candidate moves through
//! `ResolvingCustomer → ResolvingProducts → Persisting → Done | Failed`
//! inside its own unit of work. A failure rolls back that candidate only and
//! is reported; the batch continues. Only an unreachable store stops the run.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::archive::Archiver;
use crate::error::{DatabaseError, PipelineError};
use crate::mailbox::{MailSource, MessageHandle, decode_message};
use crate::pipeline::cache::LookupCache;
use crate::pipeline::duplicates::OrderFingerprint;
use crate::pipeline::reconcile::sku_variants;
use crate::pipeline::types::{
    CandidateError, CandidateInput, ExtractedLineItem, OrderTotals, fold_sku, normalize_tax_id,
};
use crate::store::{
    AuditEntry, Customer, NewCustomer, NewOrder, NewOrderLine, NewProduct, OrderSummary, Product,
    ReferenceStore, UnitOfWork,
};

// ── Stage machine ───────────────────────────────────────────────────

/// Where a candidate is in the commit sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStage {
    ResolvingCustomer,
    ResolvingProducts,
    Persisting,
    Done,
    Failed,
}

impl CommitStage {
    pub fn can_transition_to(&self, target: CommitStage) -> bool {
        use CommitStage::*;

        matches!(
            (self, target),
            (ResolvingCustomer, ResolvingProducts)
                | (ResolvingProducts, Persisting)
                | (Persisting, Done)
                | (ResolvingCustomer, Failed)
                | (ResolvingProducts, Failed)
                | (Persisting, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for CommitStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ResolvingCustomer => "resolving_customer",
            Self::ResolvingProducts => "resolving_products",
            Self::Persisting => "persisting",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

struct StageTracker<'a> {
    origin_code: &'a str,
    stage: CommitStage,
}

impl StageTracker<'_> {
    fn advance(&mut self, next: CommitStage) {
        debug_assert!(self.stage.can_transition_to(next), "{} -> {}", self.stage, next);
        debug!(origin_code = self.origin_code, from = %self.stage, to = %next, "Commit stage");
        self.stage = next;
    }
}

// ── Reports ─────────────────────────────────────────────────────────

/// Which creations the caller authorized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOptions {
    pub allow_create_customers: bool,
    pub allow_create_products: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedOrder {
    /// Code the order was persisted under.
    pub origin_code: String,
    /// Code as extracted, when an alternate was used.
    pub source_origin_code: Option<String>,
    pub order_id: String,
    pub customer_id: String,
    pub workflow_state: String,
    pub net: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub line_count: usize,
    /// SKUs left out because they did not resolve and could not be created.
    pub excluded_skus: Vec<String>,
    pub archived_document_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedOrder {
    pub origin_code: String,
    pub existing_order_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedCustomer {
    pub id: String,
    pub code: String,
    pub tax_id: String,
    pub origin_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedProduct {
    pub id: String,
    pub sku: String,
    pub origin_code: String,
}

/// Per-candidate results of one commit batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitReport {
    pub created: Vec<CreatedOrder>,
    pub skipped: Vec<SkippedOrder>,
    pub customers_created: Vec<CreatedCustomer>,
    pub products_created: Vec<CreatedProduct>,
    pub errors: Vec<CandidateError>,
    /// Set when the store became unreachable and the batch stopped early.
    pub aborted: Option<String>,
}

enum Persisted {
    Created {
        order: CreatedOrder,
        customers: Vec<Customer>,
        products: Vec<Product>,
    },
    Skipped(SkippedOrder),
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Merge lines sharing a case-folded SKU, summing quantities. First-seen
/// casing, description and unit price win; order of first appearance is kept.
pub fn consolidate(items: &[ExtractedLineItem]) -> Vec<ExtractedLineItem> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<ExtractedLineItem> = Vec::new();
    for item in items {
        match index.get(&item.folded_sku()) {
            Some(&i) => {
                merged[i].quantity = merged[i].quantity.saturating_add(item.quantity);
                if merged[i].description.is_empty() {
                    merged[i].description = item.description.clone();
                }
            }
            None => {
                index.insert(item.folded_sku(), merged.len());
                merged.push(ExtractedLineItem {
                    sku: item.sku.trim().to_string(),
                    ..item.clone()
                });
            }
        }
    }
    merged
}

/// Business code for a customer created from a tax id: `C` + body digits.
pub fn customer_code(tax_id: &str) -> String {
    let normalized = normalize_tax_id(tax_id);
    let body = match normalized.split_once('-') {
        Some((body, _)) => body.to_string(),
        None => normalized
            .char_indices()
            .last()
            .map(|(i, _)| normalized[..i].to_string())
            .unwrap_or_default(),
    };
    let digits: String = body.chars().filter(char::is_ascii_digit).collect();
    format!("C{digits}")
}

/// Fallback customer code for a body already taken by another verifier:
/// `C` + body digits + `-` + verifier.
pub fn customer_code_with_verifier(tax_id: &str) -> String {
    let normalized = normalize_tax_id(tax_id);
    let verifier = match normalized.rsplit_once('-') {
        Some((_, v)) => v.to_string(),
        None => normalized.chars().last().map(String::from).unwrap_or_default(),
    };
    format!("{}-{verifier}", customer_code(&normalized))
}

fn reject_input(input: &CandidateInput) -> Option<String> {
    if input.effective_origin_code().trim().is_empty() {
        return Some("origin code missing".into());
    }
    if input.line_items.is_empty() {
        return Some("no line items found".into());
    }
    if normalize_tax_id(&input.header.tax_id).is_empty() {
        return Some("customer tax id missing".into());
    }
    input
        .line_items
        .iter()
        .find(|l| l.quantity == 0 || l.unit_price < Decimal::ZERO || l.sku.trim().is_empty())
        .map(|l| format!("invalid line for SKU '{}'", l.sku))
}

// ── Orchestrator ────────────────────────────────────────────────────

/// Persists approved candidates.
pub struct CommitOrchestrator<'a> {
    store: &'a dyn ReferenceStore,
    cache: &'a LookupCache,
    archiver: Option<&'a Archiver>,
    mail: Option<&'a dyn MailSource>,
    tax_rate: Decimal,
    actor: String,
    options: CommitOptions,
}

impl<'a> CommitOrchestrator<'a> {
    pub fn new(
        store: &'a dyn ReferenceStore,
        cache: &'a LookupCache,
        tax_rate: Decimal,
        actor: impl Into<String>,
        options: CommitOptions,
    ) -> Self {
        Self {
            store,
            cache,
            archiver: None,
            mail: None,
            tax_rate,
            actor: actor.into(),
            options,
        }
    }

    pub fn with_archiver(mut self, archiver: &'a Archiver) -> Self {
        self.archiver = Some(archiver);
        self
    }

    /// Mail source for re-fetching documents not carried by the input.
    pub fn with_mail_source(mut self, mail: &'a dyn MailSource) -> Self {
        self.mail = Some(mail);
        self
    }

    /// Commit candidates sequentially, isolating failures per candidate.
    pub async fn commit_batch(&self, inputs: &[CandidateInput]) -> CommitReport {
        let mut report = CommitReport::default();
        info!(count = inputs.len(), "Committing candidate batch");

        for input in inputs {
            let code = input.effective_origin_code().to_string();
            let mut tracker = StageTracker {
                origin_code: &code,
                stage: CommitStage::ResolvingCustomer,
            };

            match self.commit_one(input, &mut tracker).await {
                Ok(Persisted::Created {
                    order,
                    customers,
                    products,
                }) => {
                    tracker.advance(CommitStage::Done);
                    info!(
                        origin_code = %order.origin_code,
                        order_id = %order.order_id,
                        total = %order.total,
                        "Order created"
                    );
                    for customer in customers {
                        report.customers_created.push(CreatedCustomer {
                            id: customer.id.clone(),
                            code: customer.code.clone(),
                            tax_id: customer.tax_id.clone(),
                            origin_code: code.clone(),
                        });
                        self.cache
                            .put_customer(&customer.tax_id.clone(), Some(customer))
                            .await;
                    }
                    for product in products {
                        report.products_created.push(CreatedProduct {
                            id: product.id.clone(),
                            sku: product.sku.clone(),
                            origin_code: code.clone(),
                        });
                        self.cache.put_product(&product.sku.clone(), Some(product)).await;
                    }
                    report.created.push(order);
                }
                Ok(Persisted::Skipped(skipped)) => {
                    tracker.advance(CommitStage::Done);
                    info!(origin_code = %skipped.origin_code, reason = %skipped.reason, "Candidate skipped");
                    report.skipped.push(skipped);
                }
                Err(e) => {
                    let failed_at = tracker.stage;
                    tracker.advance(CommitStage::Failed);
                    warn!(origin_code = %code, stage = %failed_at, error = %e, "Candidate failed");
                    report.errors.push(
                        CandidateError::new(failed_at.to_string(), e.to_string())
                            .for_order(&code)
                            .for_message(input.message_handle.as_deref()),
                    );
                    if let PipelineError::Persistence(db) = &e
                        && db.is_unavailable()
                    {
                        error!(error = %db, "Reference store unavailable; stopping batch");
                        report.aborted = Some(format!("reference store unavailable: {db}"));
                        break;
                    }
                }
            }
        }

        info!(
            created = report.created.len(),
            skipped = report.skipped.len(),
            failed = report.errors.len(),
            "Commit batch complete"
        );
        report
    }

    async fn commit_one(
        &self,
        input: &CandidateInput,
        tracker: &mut StageTracker<'_>,
    ) -> Result<Persisted, PipelineError> {
        if let Some(reason) = reject_input(input) {
            return Err(PipelineError::Rejected(reason));
        }

        let mut unit = self.store.begin_unit().await?;
        let mut archived = None;
        let outcome = self.run(unit.as_mut(), input, tracker, &mut archived).await;
        let outcome = match outcome {
            Ok(created @ Persisted::Created { .. }) => match unit.commit().await {
                Ok(()) => return Ok(created),
                Err(e) => Err(e.into()),
            },
            Ok(skipped @ Persisted::Skipped(_)) => {
                if let Err(e) = unit.rollback().await {
                    warn!(error = %e, "Rollback after skip failed");
                }
                Ok(skipped)
            }
            Err(e) => {
                if let Err(rb) = unit.rollback().await {
                    warn!(error = %rb, "Rollback failed");
                }
                Err(e)
            }
        };

        // No order references the document.
        if let (Some(archiver), Some(path)) = (self.archiver, archived) {
            archiver.discard(&path).await;
        }
        outcome
    }

    async fn run(
        &self,
        unit: &mut dyn UnitOfWork,
        input: &CandidateInput,
        tracker: &mut StageTracker<'_>,
        archived: &mut Option<String>,
    ) -> Result<Persisted, PipelineError> {
        let mut created_customers = Vec::new();
        let mut created_products = Vec::new();

        // Customer
        let customer = self
            .resolve_customer(unit, input, &mut created_customers)
            .await?;
        tracker.advance(CommitStage::ResolvingProducts);

        // Products, after consolidation so casing variants share one line.
        let mut lines = Vec::new();
        let mut resolved_items = Vec::new();
        let mut excluded_skus = Vec::new();
        for item in consolidate(&input.line_items) {
            match self
                .resolve_product(unit, &item, &mut created_products)
                .await?
            {
                Some(product) => {
                    lines.push(NewOrderLine {
                        product_id: product.id,
                        sku: item.sku.clone(),
                        description: item.description.clone(),
                        quantity: item.quantity,
                        unit_price: item.unit_price,
                        line_total: item.line_total(),
                    });
                    resolved_items.push(item);
                }
                None => excluded_skus.push(item.sku.clone()),
            }
        }
        if lines.is_empty() {
            return Err(PipelineError::Rejected("no resolvable line items".into()));
        }
        tracker.advance(CommitStage::Persisting);

        // Persist
        let target = input.effective_origin_code();
        let totals = OrderTotals::compute(&resolved_items, self.tax_rate);
        let fingerprint = OrderFingerprint {
            internal_reference_number: input.internal_reference_number.clone(),
            customer_id: Some(customer.id.clone()),
            total: totals.total,
        };

        if let Some(existing) = unit.find_order_by_origin_code(target).await? {
            return self.existing_order(target, &existing, &fingerprint);
        }

        let archived_document_path = self.archive(input, target).await;
        archived.clone_from(&archived_document_path);
        let state = input.confirmation_state.initial_workflow_state();
        let order = NewOrder {
            origin_code: target.to_string(),
            internal_reference_number: input.internal_reference_number.clone(),
            customer_id: customer.id.clone(),
            message_date: input.message_date,
            confirmation_state: input.confirmation_state,
            shipment_type: input.header.shipment_type.clone(),
            carrier: input.header.carrier.clone(),
            net: totals.net,
            tax: totals.tax,
            total: totals.total,
            archived_document_path: archived_document_path.clone(),
        };
        let audit = AuditEntry {
            state: state.to_string(),
            actor: self.actor.clone(),
            note: match &input.message_handle {
                Some(handle) => format!("created from message {handle}"),
                None => "created from order document".into(),
            },
        };

        let order_id = match unit.create_order(&order, &lines, &audit).await {
            Ok(id) => id,
            Err(e) if e.is_constraint() => {
                warn!(origin_code = target, "Order insert collided; re-checking");
                return match unit.find_order_by_origin_code(target).await? {
                    Some(existing) => self.existing_order(target, &existing, &fingerprint),
                    None => Err(PipelineError::Persistence(e)),
                };
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Persisted::Created {
            order: CreatedOrder {
                origin_code: target.to_string(),
                source_origin_code: input
                    .alternate_origin_code
                    .as_ref()
                    .map(|_| input.origin_code.clone()),
                order_id,
                customer_id: customer.id,
                workflow_state: state.to_string(),
                net: totals.net,
                tax: totals.tax,
                total: totals.total,
                line_count: lines.len(),
                excluded_skus,
                archived_document_path,
            },
            customers: created_customers,
            products: created_products,
        })
    }

    fn existing_order(
        &self,
        target: &str,
        existing: &OrderSummary,
        fingerprint: &OrderFingerprint,
    ) -> Result<Persisted, PipelineError> {
        if OrderFingerprint::from(existing).matches(fingerprint) {
            Ok(Persisted::Skipped(SkippedOrder {
                origin_code: target.to_string(),
                existing_order_id: Some(existing.id.clone()),
                reason: "identical order already exists".into(),
            }))
        } else {
            Err(PipelineError::DuplicateConflict {
                origin_code: target.to_string(),
            })
        }
    }

    async fn resolve_customer(
        &self,
        unit: &mut dyn UnitOfWork,
        input: &CandidateInput,
        created: &mut Vec<Customer>,
    ) -> Result<Customer, PipelineError> {
        let tax_id = normalize_tax_id(&input.header.tax_id);
        if let Some(Some(customer)) = self.cache.customer(&tax_id).await {
            return Ok(customer);
        }
        if let Some(customer) = unit.find_customer_by_tax_id(&tax_id).await? {
            return Ok(customer);
        }
        if !self.options.allow_create_customers {
            return Err(PipelineError::CustomerMissing { tax_id });
        }

        let header = &input.header;
        let new = NewCustomer {
            code: customer_code(&tax_id),
            tax_id: tax_id.clone(),
            legal_name: if header.legal_name.trim().is_empty() {
                tax_id.clone()
            } else {
                header.legal_name.trim().to_string()
            },
            address: header.address.trim().to_string(),
            district: header.district.trim().to_string(),
        };

        match unit.create_customer(&new).await {
            Ok(customer) => {
                info!(tax_id = %tax_id, code = %customer.code, "Customer created");
                created.push(customer.clone());
                Ok(customer)
            }
            Err(e) if e.is_constraint() => {
                if let Some(customer) = unit.find_customer_by_tax_id(&tax_id).await? {
                    warn!(tax_id = %tax_id, "Customer created concurrently; reusing existing row");
                    return Ok(customer);
                }
                // Same body digits, different verifier: the code is taken.
                let fallback = NewCustomer {
                    code: customer_code_with_verifier(&tax_id),
                    ..new
                };
                warn!(tax_id = %tax_id, code = %fallback.code, "Customer code taken; using verifier suffix");
                let customer = unit.create_customer(&fallback).await?;
                info!(tax_id = %tax_id, code = %customer.code, "Customer created");
                created.push(customer.clone());
                Ok(customer)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_product(
        &self,
        unit: &mut dyn UnitOfWork,
        item: &ExtractedLineItem,
        created: &mut Vec<Product>,
    ) -> Result<Option<Product>, PipelineError> {
        if let Some(Some(product)) = self.cache.product(&item.sku).await {
            return Ok(Some(product));
        }
        if let Some(product) = find_product(unit, &item.sku).await? {
            return Ok(Some(product));
        }
        if !self.options.allow_create_products {
            debug!(sku = %item.sku, "Product unresolved; excluding line");
            return Ok(None);
        }

        let new = NewProduct {
            sku: item.sku.clone(),
            name: if item.description.trim().is_empty() {
                item.sku.clone()
            } else {
                item.description.trim().to_string()
            },
            unit_price: item.unit_price,
        };

        match unit.create_product(&new).await {
            Ok(product) => {
                info!(sku = %product.sku, "Placeholder product created");
                created.push(product.clone());
                Ok(Some(product))
            }
            Err(e) if e.is_constraint() => {
                warn!(sku = %item.sku, "Product created concurrently; reusing existing row");
                unit.find_product_by_sku(&fold_sku(&item.sku), true)
                    .await?
                    .map(Some)
                    .ok_or(PipelineError::Persistence(e))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write the document, if there is one. Never fails the candidate.
    async fn archive(&self, input: &CandidateInput, target: &str) -> Option<String> {
        let archiver = self.archiver?;
        let bytes = match &input.document {
            Some(bytes) => bytes.clone(),
            None => self.refetch_document(input).await?,
        };
        archiver
            .archive_or_warn(target, input.message_date, &bytes)
            .await
    }

    async fn refetch_document(&self, input: &CandidateInput) -> Option<Vec<u8>> {
        let mail = self.mail?;
        let handle = MessageHandle::new(input.message_handle.clone()?);
        let raw = match mail.fetch_raw(&handle).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(handle = %handle, error = %e, "Could not re-fetch message for archiving");
                return None;
            }
        };
        match decode_message(&handle, &raw) {
            Ok(message) => message.attachment.map(|a| a.bytes),
            Err(e) => {
                warn!(handle = %handle, error = %e, "Could not decode re-fetched message");
                None
            }
        }
    }
}

/// Exact, upper, lower, then any casing.
async fn find_product(unit: &mut dyn UnitOfWork, sku: &str) -> Result<Option<Product>, DatabaseError> {
    for variant in sku_variants(sku) {
        if let Some(product) = unit.find_product_by_sku(&variant, false).await? {
            return Ok(Some(product));
        }
    }
    unit.find_product_by_sku(sku.trim(), true).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use rust_decimal_macros::dec;

    use async_trait::async_trait;

    use super::*;
    use crate::pipeline::types::{ConfirmationState, CustomerHeader};
    use crate::store::LibSqlBackend;

    fn item(sku: &str, qty: u32, price: Decimal) -> ExtractedLineItem {
        ExtractedLineItem {
            sku: sku.into(),
            description: String::new(),
            quantity: qty,
            unit_price: price,
        }
    }

    fn input(code: &str, items: Vec<ExtractedLineItem>) -> CandidateInput {
        CandidateInput {
            origin_code: code.into(),
            alternate_origin_code: None,
            message_handle: Some("1".into()),
            message_date: Utc::now(),
            confirmation_state: ConfirmationState::PendingApproval,
            internal_reference_number: Some("884213".into()),
            header: CustomerHeader {
                tax_id: "77.337.586-0".into(),
                legal_name: "Comercial Andes SpA".into(),
                ..Default::default()
            },
            line_items: items,
            document: None,
        }
    }

    const ALL: CommitOptions = CommitOptions {
        allow_create_customers: true,
        allow_create_products: true,
    };

    #[test]
    fn consolidation_sums_case_variants() {
        let merged = consolidate(&[
            item("abc123", 1, dec!(10)),
            item("XYZ", 2, dec!(5)),
            item("ABC123", 3, dec!(99)),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].sku, "abc123");
        assert_eq!(merged[0].quantity, 4);
        assert_eq!(merged[0].unit_price, dec!(10));
        assert_eq!(merged[1].sku, "XYZ");
    }

    #[test]
    fn customer_code_from_tax_id() {
        assert_eq!(customer_code("77.337.586-0"), "C77337586");
        assert_eq!(customer_code("12345678-k"), "C12345678");
        assert_eq!(customer_code("123456785"), "C12345678");
        assert_eq!(customer_code_with_verifier("12.345.678-k"), "C12345678-K");
        assert_eq!(customer_code_with_verifier("123456785"), "C12345678-5");
    }

    #[test]
    fn stage_transitions() {
        use CommitStage::*;
        assert!(ResolvingCustomer.can_transition_to(ResolvingProducts));
        assert!(Persisting.can_transition_to(Failed));
        assert!(!ResolvingCustomer.can_transition_to(Persisting));
        assert!(!Done.can_transition_to(Failed));
        assert!(Done.is_terminal());
    }

    #[tokio::test]
    async fn creates_customer_products_and_order() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let cache = LookupCache::new(Duration::from_secs(60));
        let orchestrator = CommitOrchestrator::new(&db, &cache, dec!(0.19), "tester", ALL);

        let report = orchestrator
            .commit_batch(&[input(
                "OC-1",
                vec![item("abc123", 1, dec!(1000)), item("ABC123", 1, dec!(1000))],
            )])
            .await;

        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.created.len(), 1);
        let created = &report.created[0];
        assert_eq!(created.line_count, 1);
        assert_eq!(created.net, dec!(2000));
        assert_eq!(created.tax, dec!(380));
        assert_eq!(created.total, dec!(2380));
        assert_eq!(created.workflow_state, "pending_credit_approval");
        assert_eq!(report.customers_created.len(), 1);
        assert_eq!(report.customers_created[0].code, "C77337586");
        assert_eq!(report.products_created.len(), 1);
        assert!(db.find_order_by_origin_code("OC-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_customer_without_permission_writes_nothing() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let cache = LookupCache::new(Duration::from_secs(60));
        let orchestrator =
            CommitOrchestrator::new(&db, &cache, dec!(0.19), "tester", CommitOptions::default());

        let report = orchestrator
            .commit_batch(&[input("OC-1", vec![item("A", 1, dec!(1))])])
            .await;
        assert!(report.created.is_empty());
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].stage, "resolving_customer");
        assert!(db.find_customer_by_tax_id("77337586-0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unresolvable_products_roll_back_new_customer() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let cache = LookupCache::new(Duration::from_secs(60));
        let options = CommitOptions {
            allow_create_customers: true,
            allow_create_products: false,
        };
        let orchestrator = CommitOrchestrator::new(&db, &cache, dec!(0.19), "tester", options);

        let report = orchestrator
            .commit_batch(&[input("OC-1", vec![item("A", 1, dec!(1))])])
            .await;
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].stage, "resolving_products");
        assert!(report.customers_created.is_empty());
        assert!(db.find_customer_by_tax_id("77337586-0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_candidate_is_rejected_and_batch_continues() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let cache = LookupCache::new(Duration::from_secs(60));
        let orchestrator = CommitOrchestrator::new(&db, &cache, dec!(0.19), "tester", ALL);

        let report = orchestrator
            .commit_batch(&[
                input("OC-EMPTY", Vec::new()),
                input("OC-2", vec![item("B", 2, dec!(50))]),
            ])
            .await;
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].message.contains("no line items found"));
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.created[0].origin_code, "OC-2");
        assert!(db.find_order_by_origin_code("OC-EMPTY").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recommitting_is_skipped_and_conflict_fails() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let cache = LookupCache::new(Duration::from_secs(60));
        let orchestrator = CommitOrchestrator::new(&db, &cache, dec!(0.19), "tester", ALL);

        let first = input("OC-1", vec![item("A", 1, dec!(100))]);
        orchestrator.commit_batch(&[first.clone()]).await;

        let again = orchestrator.commit_batch(&[first]).await;
        assert_eq!(again.skipped.len(), 1);
        assert!(again.created.is_empty());

        let changed = orchestrator
            .commit_batch(&[input("OC-1", vec![item("A", 5, dec!(100))])])
            .await;
        assert_eq!(changed.errors.len(), 1);
        assert_eq!(changed.errors[0].stage, "persisting");
    }

    #[tokio::test]
    async fn archives_document_with_message_date() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let cache = LookupCache::new(Duration::from_secs(60));
        let dir = tempfile::tempdir().unwrap();
        let archiver = Archiver::new(dir.path());
        let orchestrator =
            CommitOrchestrator::new(&db, &cache, dec!(0.19), "tester", ALL).with_archiver(&archiver);

        let mut candidate = input("OC-7", vec![item("A", 1, dec!(1))]);
        candidate.document = Some(b"%PDF-1.4".to_vec());
        let report = orchestrator.commit_batch(&[candidate.clone()]).await;

        let path = report.created[0].archived_document_path.clone().unwrap();
        assert_eq!(
            path,
            Archiver::relative_path("OC-7", candidate.message_date).unwrap()
        );
        assert!(dir.path().join(path).exists());
    }

    #[tokio::test]
    async fn tax_ids_differing_in_verifier_get_distinct_codes() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let cache = LookupCache::new(Duration::from_secs(60));
        let orchestrator = CommitOrchestrator::new(&db, &cache, dec!(0.19), "tester", ALL);

        let mut first = input("OC-1", vec![item("A", 1, dec!(10))]);
        first.header.tax_id = "12.345.678-5".into();
        let mut second = input("OC-2", vec![item("A", 1, dec!(10))]);
        second.header.tax_id = "12.345.678-K".into();

        let report = orchestrator.commit_batch(&[first, second]).await;
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.created.len(), 2);
        let codes: Vec<&str> = report.customers_created.iter().map(|c| c.code.as_str()).collect();
        assert_eq!(codes, ["C12345678", "C12345678-K"]);
        assert_ne!(report.created[0].customer_id, report.created[1].customer_id);
    }

    /// Delegates to libSQL but fails every order insert.
    struct BrokenOrders(LibSqlBackend);

    struct BrokenOrdersUnit(Box<dyn UnitOfWork>);

    #[async_trait]
    impl ReferenceStore for BrokenOrders {
        async fn find_customer_by_tax_id(&self, tax_id: &str) -> Result<Option<Customer>, DatabaseError> {
            self.0.find_customer_by_tax_id(tax_id).await
        }

        async fn find_product_by_sku(
            &self,
            sku: &str,
            case_insensitive: bool,
        ) -> Result<Option<Product>, DatabaseError> {
            self.0.find_product_by_sku(sku, case_insensitive).await
        }

        async fn find_order_by_origin_code(
            &self,
            origin_code: &str,
        ) -> Result<Option<OrderSummary>, DatabaseError> {
            self.0.find_order_by_origin_code(origin_code).await
        }

        async fn begin_unit(&self) -> Result<Box<dyn UnitOfWork>, DatabaseError> {
            Ok(Box::new(BrokenOrdersUnit(self.0.begin_unit().await?)))
        }
    }

    #[async_trait]
    impl UnitOfWork for BrokenOrdersUnit {
        async fn find_customer_by_tax_id(&mut self, tax_id: &str) -> Result<Option<Customer>, DatabaseError> {
            self.0.find_customer_by_tax_id(tax_id).await
        }

        async fn find_product_by_sku(
            &mut self,
            sku: &str,
            case_insensitive: bool,
        ) -> Result<Option<Product>, DatabaseError> {
            self.0.find_product_by_sku(sku, case_insensitive).await
        }

        async fn find_order_by_origin_code(
            &mut self,
            origin_code: &str,
        ) -> Result<Option<OrderSummary>, DatabaseError> {
            self.0.find_order_by_origin_code(origin_code).await
        }

        async fn create_customer(&mut self, customer: &NewCustomer) -> Result<Customer, DatabaseError> {
            self.0.create_customer(customer).await
        }

        async fn create_product(&mut self, product: &NewProduct) -> Result<Product, DatabaseError> {
            self.0.create_product(product).await
        }

        async fn create_order(
            &mut self,
            _order: &NewOrder,
            _lines: &[NewOrderLine],
            _audit: &AuditEntry,
        ) -> Result<String, DatabaseError> {
            Err(DatabaseError::Query("disk I/O error".into()))
        }

        async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
            self.0.commit().await
        }

        async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
            self.0.rollback().await
        }
    }

    #[tokio::test]
    async fn failed_insert_leaves_no_archived_document() {
        let store = BrokenOrders(LibSqlBackend::new_memory().await.unwrap());
        let cache = LookupCache::new(Duration::from_secs(60));
        let dir = tempfile::tempdir().unwrap();
        let archiver = Archiver::new(dir.path());
        let orchestrator =
            CommitOrchestrator::new(&store, &cache, dec!(0.19), "tester", ALL).with_archiver(&archiver);

        let mut candidate = input("OC-8", vec![item("A", 1, dec!(1))]);
        candidate.document = Some(b"%PDF-1.4".to_vec());
        let report = orchestrator.commit_batch(&[candidate.clone()]).await;

        assert!(report.created.is_empty());
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].stage, "persisting");
        let path = Archiver::relative_path("OC-8", candidate.message_date).unwrap();
        assert!(!dir.path().join(path).exists());
        assert!(store.0.find_customer_by_tax_id("77337586-0").await.unwrap().is_none());
    }
}
