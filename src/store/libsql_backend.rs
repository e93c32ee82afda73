//! libSQL backend — async `ReferenceStore` implementation.
//!
//! Supports local file and in-memory databases. Every commit candidate gets
//! its own libSQL transaction, wrapped in `LibSqlUnit`.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Transaction, params};
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::fold_sku;
use crate::store::migrations;
use crate::store::traits::{
    AuditEntry, Customer, NewCustomer, NewOrder, NewOrderLine, NewProduct, OrderSummary, Product,
    ReferenceStore, UnitOfWork,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

const CUSTOMER_COLUMNS: &str = "id, code, tax_id, legal_name, address, district, created_at";
const PRODUCT_COLUMNS: &str = "id, sku, name, unit_price, needs_enrichment";
const ORDER_SUMMARY_COLUMNS: &str = "id, origin_code, internal_reference_number, customer_id, total";

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_decimal(s: &str, column: &str) -> Result<Decimal, DatabaseError> {
    Decimal::from_str(s)
        .map_err(|e| DatabaseError::Serialization(format!("{column} is not a decimal ({s}): {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Map a failed write, telling uniqueness violations apart from other failures.
fn write_error(op: &str, e: libsql::Error) -> DatabaseError {
    let unique = match &e {
        // SQLITE_CONSTRAINT_UNIQUE / SQLITE_CONSTRAINT_PRIMARYKEY
        libsql::Error::SqliteFailure(code, _) => *code == 2067 || *code == 1555,
        _ => false,
    } || e.to_string().contains("UNIQUE constraint failed");

    if unique {
        DatabaseError::Constraint(format!("{op}: {e}"))
    } else {
        DatabaseError::Query(format!("{op}: {e}"))
    }
}

fn row_to_customer(row: &libsql::Row) -> Result<Customer, libsql::Error> {
    let created_str: String = row.get(6)?;
    Ok(Customer {
        id: row.get(0)?,
        code: row.get(1)?,
        tax_id: row.get(2)?,
        legal_name: row.get(3)?,
        address: row.get(4)?,
        district: row.get(5)?,
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_product(row: &libsql::Row) -> Result<Product, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("product row parse: {e}"));
    let price: String = row.get(3).map_err(read)?;
    let needs_enrichment: i64 = row.get(4).map_err(read)?;
    Ok(Product {
        id: row.get(0).map_err(read)?,
        sku: row.get(1).map_err(read)?,
        name: row.get(2).map_err(read)?,
        unit_price: parse_decimal(&price, "products.unit_price")?,
        needs_enrichment: needs_enrichment != 0,
    })
}

fn row_to_order_summary(row: &libsql::Row) -> Result<OrderSummary, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("order row parse: {e}"));
    let total: String = row.get(4).map_err(read)?;
    Ok(OrderSummary {
        id: row.get(0).map_err(read)?,
        origin_code: row.get(1).map_err(read)?,
        internal_reference_number: row.get::<String>(2).ok(),
        customer_id: row.get::<String>(3).ok(),
        total: parse_decimal(&total, "orders.total")?,
    })
}

// ── Queries shared by the backend and its units of work ─────────────

async fn query_customer_by_tax_id(
    conn: &Connection,
    tax_id: &str,
) -> Result<Option<Customer>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {CUSTOMER_COLUMNS} FROM customers WHERE tax_id = ?1"),
            params![tax_id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("find_customer_by_tax_id: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => {
            let customer = row_to_customer(&row).map_err(|e| {
                DatabaseError::Query(format!("find_customer_by_tax_id row parse: {e}"))
            })?;
            Ok(Some(customer))
        }
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("find_customer_by_tax_id: {e}"))),
    }
}

async fn query_product_by_sku(
    conn: &Connection,
    sku: &str,
    case_insensitive: bool,
) -> Result<Option<Product>, DatabaseError> {
    let (sql, key) = if case_insensitive {
        (
            format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE sku_folded = ?1"),
            fold_sku(sku),
        )
    } else {
        (
            format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE sku = ?1 LIMIT 1"),
            sku.to_string(),
        )
    };

    let mut rows = conn
        .query(&sql, params![key])
        .await
        .map_err(|e| DatabaseError::Query(format!("find_product_by_sku: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_product(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("find_product_by_sku: {e}"))),
    }
}

async fn query_order_by_origin_code(
    conn: &Connection,
    origin_code: &str,
) -> Result<Option<OrderSummary>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {ORDER_SUMMARY_COLUMNS} FROM orders WHERE origin_code = ?1"),
            params![origin_code],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("find_order_by_origin_code: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_order_summary(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("find_order_by_origin_code: {e}"))),
    }
}

// ── ReferenceStore ──────────────────────────────────────────────────

#[async_trait]
impl ReferenceStore for LibSqlBackend {
    async fn find_customer_by_tax_id(&self, tax_id: &str) -> Result<Option<Customer>, DatabaseError> {
        query_customer_by_tax_id(self.conn(), tax_id).await
    }

    async fn find_product_by_sku(
        &self,
        sku: &str,
        case_insensitive: bool,
    ) -> Result<Option<Product>, DatabaseError> {
        query_product_by_sku(self.conn(), sku, case_insensitive).await
    }

    async fn find_order_by_origin_code(
        &self,
        origin_code: &str,
    ) -> Result<Option<OrderSummary>, DatabaseError> {
        query_order_by_origin_code(self.conn(), origin_code).await
    }

    async fn begin_unit(&self) -> Result<Box<dyn UnitOfWork>, DatabaseError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to begin transaction: {e}")))?;
        Ok(Box::new(LibSqlUnit { tx }))
    }
}

// ── UnitOfWork ──────────────────────────────────────────────────────

/// One libSQL transaction. Rolled back on drop unless committed.
pub struct LibSqlUnit {
    tx: Transaction,
}

#[async_trait]
impl UnitOfWork for LibSqlUnit {
    async fn find_customer_by_tax_id(&mut self, tax_id: &str) -> Result<Option<Customer>, DatabaseError> {
        query_customer_by_tax_id(&self.tx, tax_id).await
    }

    async fn find_product_by_sku(
        &mut self,
        sku: &str,
        case_insensitive: bool,
    ) -> Result<Option<Product>, DatabaseError> {
        query_product_by_sku(&self.tx, sku, case_insensitive).await
    }

    async fn find_order_by_origin_code(
        &mut self,
        origin_code: &str,
    ) -> Result<Option<OrderSummary>, DatabaseError> {
        query_order_by_origin_code(&self.tx, origin_code).await
    }

    async fn create_customer(&mut self, customer: &NewCustomer) -> Result<Customer, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        self.tx
            .execute(
                "INSERT INTO customers (id, code, tax_id, legal_name, address, district, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.clone(),
                    customer.code.clone(),
                    customer.tax_id.clone(),
                    customer.legal_name.clone(),
                    customer.address.clone(),
                    customer.district.clone(),
                    now.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| write_error("create_customer", e))?;

        debug!(customer_id = %id, code = %customer.code, "Customer inserted into DB");
        Ok(Customer {
            id,
            code: customer.code.clone(),
            tax_id: customer.tax_id.clone(),
            legal_name: customer.legal_name.clone(),
            address: customer.address.clone(),
            district: customer.district.clone(),
            created_at: now,
        })
    }

    async fn create_product(&mut self, product: &NewProduct) -> Result<Product, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        self.tx
            .execute(
                "INSERT INTO products (id, sku, sku_folded, name, unit_price, needs_enrichment, created_at) VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
                params![
                    id.clone(),
                    product.sku.clone(),
                    fold_sku(&product.sku),
                    product.name.clone(),
                    product.unit_price.to_string(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| write_error("create_product", e))?;

        debug!(product_id = %id, sku = %product.sku, "Placeholder product inserted into DB");
        Ok(Product {
            id,
            sku: product.sku.clone(),
            name: product.name.clone(),
            unit_price: product.unit_price,
            needs_enrichment: true,
        })
    }

    async fn create_order(
        &mut self,
        order: &NewOrder,
        lines: &[NewOrderLine],
        audit: &AuditEntry,
    ) -> Result<String, DatabaseError> {
        let order_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        self.tx
            .execute(
                "INSERT INTO orders (id, origin_code, internal_reference_number, customer_id, message_date, confirmation_state, shipment_type, carrier, net, tax, total, archived_document_path, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    order_id.clone(),
                    order.origin_code.clone(),
                    opt_text(order.internal_reference_number.as_deref()),
                    order.customer_id.clone(),
                    order.message_date.to_rfc3339(),
                    order.confirmation_state.to_string(),
                    order.shipment_type.clone(),
                    order.carrier.clone(),
                    order.net.to_string(),
                    order.tax.to_string(),
                    order.total.to_string(),
                    opt_text(order.archived_document_path.as_deref()),
                    now.clone(),
                ],
            )
            .await
            .map_err(|e| write_error("create_order", e))?;

        for (line_no, line) in lines.iter().enumerate() {
            self.tx
                .execute(
                    "INSERT INTO order_lines (id, order_id, line_no, product_id, sku, description, quantity, unit_price, line_total) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        Uuid::new_v4().to_string(),
                        order_id.clone(),
                        (line_no + 1) as i64,
                        line.product_id.clone(),
                        line.sku.clone(),
                        line.description.clone(),
                        i64::from(line.quantity),
                        line.unit_price.to_string(),
                        line.line_total.to_string(),
                    ],
                )
                .await
                .map_err(|e| write_error("create_order line", e))?;
        }

        self.tx
            .execute(
                "INSERT INTO order_audit (id, order_id, state, actor, note, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    order_id.clone(),
                    audit.state.clone(),
                    audit.actor.clone(),
                    audit.note.clone(),
                    now,
                ],
            )
            .await
            .map_err(|e| write_error("create_order audit", e))?;

        debug!(order_id = %order_id, origin_code = %order.origin_code, lines = lines.len(), "Order inserted into DB");
        Ok(order_id)
    }

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        self.tx
            .commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit: {e}")))
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| DatabaseError::Query(format!("rollback: {e}")))
    }
}

// ── Tests ───────────────────────────────────────────────────────────
