//! Customer, product and order access for the pipeline.
//!
//! The pipeline only ever creates rows; it never updates or deletes them.
//! Reads outside a commit go through `ReferenceStore`; everything a single
//! commit candidate writes goes through one `UnitOfWork`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::pipeline::types::ConfirmationState;

/// A customer master record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    /// Business code, derived from the tax id.
    pub code: String,
    /// Normalized tax id.
    pub tax_id: String,
    pub legal_name: String,
    pub address: String,
    pub district: String,
    pub created_at: DateTime<Utc>,
}

/// Fields for a new customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCustomer {
    pub code: String,
    pub tax_id: String,
    pub legal_name: String,
    pub address: String,
    pub district: String,
}

/// A product master record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub sku: String,
    pub name: String,
    pub unit_price: Decimal,
    /// Created from an order document and still waiting for manual data entry.
    pub needs_enrichment: bool,
}

/// Fields for a new placeholder product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProduct {
    pub sku: String,
    pub name: String,
    pub unit_price: Decimal,
}

/// What duplicate detection needs to know about a persisted order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSummary {
    pub id: String,
    pub origin_code: String,
    pub internal_reference_number: Option<String>,
    pub customer_id: Option<String>,
    pub total: Decimal,
}

/// Order header to persist.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub origin_code: String,
    pub internal_reference_number: Option<String>,
    pub customer_id: String,
    pub message_date: DateTime<Utc>,
    pub confirmation_state: ConfirmationState,
    pub shipment_type: String,
    pub carrier: String,
    pub net: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    /// Relative to the archive root.
    pub archived_document_path: Option<String>,
}

/// One order line to persist.
#[derive(Debug, Clone)]
pub struct NewOrderLine {
    pub product_id: String,
    pub sku: String,
    pub description: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

/// Initial workflow entry written with every order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub state: String,
    pub actor: String,
    pub note: String,
}

/// Read access to the reference data.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    /// Look up a customer by normalized tax id.
    async fn find_customer_by_tax_id(&self, tax_id: &str) -> Result<Option<Customer>, DatabaseError>;

    /// Look up a product by SKU, either exactly or ignoring case.
    async fn find_product_by_sku(
        &self,
        sku: &str,
        case_insensitive: bool,
    ) -> Result<Option<Product>, DatabaseError>;

    /// Look up an existing order by its origin code.
    async fn find_order_by_origin_code(
        &self,
        origin_code: &str,
    ) -> Result<Option<OrderSummary>, DatabaseError>;

    /// Start a unit of work for one commit candidate.
    async fn begin_unit(&self) -> Result<Box<dyn UnitOfWork>, DatabaseError>;
}

/// A transaction scoped to one commit candidate.
///
/// Dropping a unit without calling `commit` discards its writes.
#[async_trait]
pub trait UnitOfWork: Send {
    async fn find_customer_by_tax_id(&mut self, tax_id: &str) -> Result<Option<Customer>, DatabaseError>;

    async fn find_product_by_sku(
        &mut self,
        sku: &str,
        case_insensitive: bool,
    ) -> Result<Option<Product>, DatabaseError>;

    async fn find_order_by_origin_code(
        &mut self,
        origin_code: &str,
    ) -> Result<Option<OrderSummary>, DatabaseError>;

    /// Insert a customer. A duplicate tax id or code yields `DatabaseError::Constraint`.
    async fn create_customer(&mut self, customer: &NewCustomer) -> Result<Customer, DatabaseError>;

    /// Insert a placeholder product. A duplicate SKU yields `DatabaseError::Constraint`.
    async fn create_product(&mut self, product: &NewProduct) -> Result<Product, DatabaseError>;

    /// Insert the order header, its lines and the initial audit entry.
    /// Returns the new order id.
    async fn create_order(
        &mut self,
        order: &NewOrder,
        lines: &[NewOrderLine],
        audit: &AuditEntry,
    ) -> Result<String, DatabaseError>;

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError>;

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError>;
}
