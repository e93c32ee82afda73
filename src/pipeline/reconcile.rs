//! Reconciliation of extracted identifiers against the reference store,
//! and the validation status that follows from it.

use tracing::debug;

use crate::error::DatabaseError;
use crate::pipeline::cache::LookupCache;
use crate::pipeline::types::{
    Advisory, AdvisoryKind, CandidateOrder, DuplicateStatus, ResolvedLine, ValidationOutcome,
    ValidationStatus, normalize_tax_id,
};
use crate::store::{Customer, Product, ReferenceStore};

/// Exact, upper-cased and lower-cased forms of a SKU, in lookup order.
pub fn sku_variants(sku: &str) -> Vec<String> {
    let exact = sku.trim().to_string();
    let mut variants = vec![exact.clone()];
    for v in [exact.to_uppercase(), exact.to_lowercase()] {
        if !variants.contains(&v) {
            variants.push(v);
        }
    }
    variants
}

/// Customer and product matches for one candidate.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub customer_id: Option<String>,
    /// One entry per extracted line, same order.
    pub lines: Vec<ResolvedLine>,
    pub advisories: Vec<Advisory>,
}

/// Read-only resolver. Never creates anything.
pub struct Resolver<'a> {
    store: &'a dyn ReferenceStore,
    cache: &'a LookupCache,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a dyn ReferenceStore, cache: &'a LookupCache) -> Self {
        Self { store, cache }
    }

    /// Customer by tax id, formatting ignored.
    pub async fn customer(&self, tax_id: &str) -> Result<Option<Customer>, DatabaseError> {
        if let Some(cached) = self.cache.customer(tax_id).await {
            return Ok(cached);
        }
        let found = self
            .store
            .find_customer_by_tax_id(&normalize_tax_id(tax_id))
            .await?;
        self.cache.put_customer(tax_id, found.clone()).await;
        Ok(found)
    }

    /// Product by SKU: exact, then upper-cased, then lower-cased, then any casing.
    pub async fn product(&self, sku: &str) -> Result<Option<Product>, DatabaseError> {
        if let Some(cached) = self.cache.product(sku).await {
            return Ok(cached);
        }
        let mut found = None;
        for variant in sku_variants(sku) {
            found = self.store.find_product_by_sku(&variant, false).await?;
            if found.is_some() {
                break;
            }
        }
        if found.is_none() {
            found = self.store.find_product_by_sku(sku.trim(), true).await?;
        }
        self.cache.put_product(sku, found.clone()).await;
        Ok(found)
    }

    /// Resolve the candidate's customer and every line's product.
    pub async fn resolve(&self, candidate: &CandidateOrder) -> Result<Resolution, DatabaseError> {
        let mut resolution = Resolution::default();

        let tax_id = candidate.header.tax_id.trim();
        if !tax_id.is_empty() {
            match self.customer(tax_id).await? {
                Some(customer) => resolution.customer_id = Some(customer.id),
                None => resolution.advisories.push(Advisory::new(
                    AdvisoryKind::ReconciliationMiss,
                    format!("customer {tax_id} not found"),
                )),
            }
        }

        for item in &candidate.line_items {
            let product = self.product(&item.sku).await?;
            if product.is_none() {
                resolution.advisories.push(Advisory::new(
                    AdvisoryKind::ReconciliationMiss,
                    format!("product {} not found", item.sku),
                ));
            }
            resolution.lines.push(ResolvedLine {
                sku: item.sku.clone(),
                resolved_product_id: product.map(|p| p.id),
            });
        }

        debug!(
            origin_code = %candidate.origin_code,
            customer = ?resolution.customer_id,
            unresolved = resolution.lines.iter().filter(|l| l.resolved_product_id.is_none()).count(),
            "Candidate resolved"
        );
        Ok(resolution)
    }
}

/// Derive the validation outcome.
///
/// Precedence: ERROR when nothing can be committed (no line items, no origin
/// code, or a conflict without a free alternate code); else WARNING when the
/// customer or any product is unresolved, a required field is missing, or
/// the order conflicts with an existing one; else VALID.
pub fn classify(
    candidate: &CandidateOrder,
    extraction_advisories: Vec<Advisory>,
    resolution: Resolution,
) -> ValidationOutcome {
    let mut advisories = extraction_advisories;
    let mut fatal = false;

    if candidate.origin_code.is_empty() {
        fatal = true;
        let missing = Advisory::field_missing("origin_code");
        if !advisories.contains(&missing) {
            advisories.push(missing);
        }
    }
    if candidate.line_items.is_empty() {
        fatal = true;
        advisories.push(Advisory::new(AdvisoryKind::ExtractionError, "no line items found"));
    }

    let customer_unresolved = resolution.customer_id.is_none();
    let product_unresolved = resolution
        .lines
        .iter()
        .any(|l| l.resolved_product_id.is_none());
    let field_missing = advisories.iter().any(|a| a.kind == AdvisoryKind::FieldMissing);
    advisories.extend(resolution.advisories);

    match &candidate.duplicate {
        DuplicateStatus::New => {}
        DuplicateStatus::ExactDuplicate { .. } => advisories.push(Advisory::new(
            AdvisoryKind::ExactDuplicate,
            format!("identical order {} already exists", candidate.origin_code),
        )),
        DuplicateStatus::Conflict { .. } => match &candidate.alternate_origin_code {
            Some(alt) => advisories.push(Advisory::new(
                AdvisoryKind::DuplicateConflict,
                format!(
                    "order {} already exists with different content; will be created as {alt}",
                    candidate.origin_code
                ),
            )),
            None => {
                fatal = true;
                advisories.push(Advisory::new(
                    AdvisoryKind::DuplicateConflict,
                    format!("order {} conflicts and no alternate code is free", candidate.origin_code),
                ));
            }
        },
    }

    let status = if fatal {
        ValidationStatus::Error
    } else if customer_unresolved
        || product_unresolved
        || field_missing
        || candidate.duplicate.is_conflict()
    {
        ValidationStatus::Warning
    } else {
        ValidationStatus::Valid
    };

    ValidationOutcome {
        status,
        default_selected: status != ValidationStatus::Error && !candidate.duplicate.is_exact(),
        advisories,
        resolved_customer_id: resolution.customer_id,
        resolved_line_items: resolution.lines,
    }
}
