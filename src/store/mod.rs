//! libSQL-backed reference store for customers, products and orders.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::{LibSqlBackend, LibSqlUnit};
pub use traits::{
    AuditEntry, Customer, NewCustomer, NewOrder, NewOrderLine, NewProduct, OrderSummary, Product,
    ReferenceStore, UnitOfWork,
};
