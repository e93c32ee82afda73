//! Run-scoped lookup cache for reference data.
//!
//! One cache is created per preview or commit run and handed to the
//! resolver. Entries expire after a fixed TTL so a long `watch` run never
//! serves stale master data. Misses are cached too; commit overwrites them
//! when it creates the missing row.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::pipeline::types::{fold_sku, normalize_tax_id};
use crate::store::{Customer, Product};

struct Entry<T> {
    value: Option<T>,
    stored_at: Instant,
}

/// TTL cache of customer and product lookups.
pub struct LookupCache {
    ttl: Duration,
    customers: RwLock<HashMap<String, Entry<Customer>>>,
    products: RwLock<HashMap<String, Entry<Product>>>,
}

impl LookupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            customers: RwLock::new(HashMap::new()),
            products: RwLock::new(HashMap::new()),
        }
    }

    /// Cached customer lookup. Outer `None` means not cached.
    pub async fn customer(&self, tax_id: &str) -> Option<Option<Customer>> {
        let customers = self.customers.read().await;
        self.fresh(customers.get(&normalize_tax_id(tax_id)))
    }

    pub async fn put_customer(&self, tax_id: &str, customer: Option<Customer>) {
        self.customers.write().await.insert(
            normalize_tax_id(tax_id),
            Entry {
                value: customer,
                stored_at: Instant::now(),
            },
        );
    }

    /// Cached product lookup by SKU in any casing. Outer `None` means not cached.
    pub async fn product(&self, sku: &str) -> Option<Option<Product>> {
        let products = self.products.read().await;
        self.fresh(products.get(&fold_sku(sku)))
    }

    pub async fn put_product(&self, sku: &str, product: Option<Product>) {
        self.products.write().await.insert(
            fold_sku(sku),
            Entry {
                value: product,
                stored_at: Instant::now(),
            },
        );
    }

    /// Number of live entries (customers, products).
    pub async fn live_counts(&self) -> (usize, usize) {
        let customers = self.customers.read().await;
        let products = self.products.read().await;
        (
            customers.values().filter(|e| self.is_live(e)).count(),
            products.values().filter(|e| self.is_live(e)).count(),
        )
    }

    fn is_live<T>(&self, entry: &Entry<T>) -> bool {
        entry.stored_at.elapsed() < self.ttl
    }

    fn fresh<T: Clone>(&self, entry: Option<&Entry<T>>) -> Option<Option<T>> {
        entry
            .filter(|e| self.is_live(e))
            .map(|e| e.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal_macros::dec;

    use super::*;

    fn customer() -> Customer {
        Customer {
            id: "c1".into(),
            code: "C77337586".into(),
            tax_id: "77337586-0".into(),
            legal_name: "Comercial Andes SpA".into(),
            address: String::new(),
            district: String::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn hits_ignore_formatting_and_case() {
        let cache = LookupCache::new(Duration::from_secs(60));
        cache.put_customer("77.337.586-0", Some(customer())).await;
        cache
            .put_product(
                "abc123",
                Some(Product {
                    id: "p1".into(),
                    sku: "ABC123".into(),
                    name: "Tornillo".into(),
                    unit_price: dec!(1000),
                    needs_enrichment: false,
                }),
            )
            .await;

        let hit = cache.customer("77337586-0").await.unwrap().unwrap();
        assert_eq!(hit.id, "c1");
        assert_eq!(cache.product("ABC123").await.unwrap().unwrap().id, "p1");
        assert!(cache.product("XYZ").await.is_none());
        assert_eq!(cache.live_counts().await, (1, 1));
    }

    #[tokio::test]
    async fn misses_are_cached() {
        let cache = LookupCache::new(Duration::from_secs(60));
        cache.put_customer("1-9", None).await;
        assert_eq!(cache.customer("1-9").await, Some(None));
    }

    #[tokio::test]
    async fn expired_entries_are_ignored() {
        let cache = LookupCache::new(Duration::ZERO);
        cache.put_customer("77337586-0", Some(customer())).await;
        assert!(cache.customer("77337586-0").await.is_none());
        assert_eq!(cache.live_counts().await, (0, 0));
    }
}
