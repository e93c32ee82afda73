//! Duplicate detection and alternate origin code synthesis.
//!
//! An existing order with the same origin code is either an exact duplicate
//! (same reference number, customer and total within 0.01) or a conflicting
//! resubmission, which gets an alternate code `{code}-R`, `{code}-R2`, ...
//!
//! Within one run, later candidates are also compared against earlier ones
//! sharing their origin code, and codes handed out earlier are never reused.

use std::collections::{HashMap, HashSet};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info};

use crate::error::{DatabaseError, PipelineError};
use crate::pipeline::types::DuplicateStatus;
use crate::store::{OrderSummary, ReferenceStore};

/// Appended to conflicting origin codes.
pub const ALTERNATE_SUFFIX: &str = "-R";

/// Upper bound on alternate codes tried per candidate.
pub const MAX_ALTERNATE_ATTEMPTS: u32 = 99;

/// Totals closer than this are equal.
pub const AMOUNT_TOLERANCE: Decimal = dec!(0.01);

/// The fields two orders are compared on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderFingerprint {
    pub internal_reference_number: Option<String>,
    pub customer_id: Option<String>,
    pub total: Decimal,
}

impl OrderFingerprint {
    pub fn matches(&self, other: &OrderFingerprint) -> bool {
        self.internal_reference_number == other.internal_reference_number
            && self.customer_id == other.customer_id
            && (self.total - other.total).abs() <= AMOUNT_TOLERANCE
    }
}

impl From<&OrderSummary> for OrderFingerprint {
    fn from(order: &OrderSummary) -> Self {
        Self {
            internal_reference_number: order.internal_reference_number.clone(),
            customer_id: order.customer_id.clone(),
            total: order.total,
        }
    }
}

/// Alternate code for the given attempt, 1-based.
pub fn alternate_code(origin_code: &str, attempt: u32) -> String {
    if attempt <= 1 {
        format!("{origin_code}{ALTERNATE_SUFFIX}")
    } else {
        format!("{origin_code}{ALTERNATE_SUFFIX}{attempt}")
    }
}

/// Result of checking one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateCheck {
    pub status: DuplicateStatus,
    /// Set for conflicts that found a free code.
    pub alternate_origin_code: Option<String>,
}

impl DuplicateCheck {
    pub fn new_order() -> Self {
        Self {
            status: DuplicateStatus::New,
            alternate_origin_code: None,
        }
    }
}

/// Run-scoped detector. Candidates must be checked in processing order.
pub struct DuplicateDetector<'a> {
    store: &'a dyn ReferenceStore,
    /// Earlier candidates of this run, by origin code.
    seen: HashMap<String, Vec<OrderFingerprint>>,
    /// Codes claimed by earlier candidates of this run.
    reserved: HashSet<String>,
}

impl<'a> DuplicateDetector<'a> {
    pub fn new(store: &'a dyn ReferenceStore) -> Self {
        Self {
            store,
            seen: HashMap::new(),
            reserved: HashSet::new(),
        }
    }

    /// Classify a candidate and reserve the code it would be created under.
    pub async fn check(
        &mut self,
        origin_code: &str,
        fingerprint: &OrderFingerprint,
    ) -> Result<DuplicateCheck, PipelineError> {
        if origin_code.is_empty() {
            return Ok(DuplicateCheck::new_order());
        }

        let existing = self.store.find_order_by_origin_code(origin_code).await?;
        let earlier = self.seen.get(origin_code);

        let check = match existing {
            Some(order) if OrderFingerprint::from(&order).matches(fingerprint) => DuplicateCheck {
                status: DuplicateStatus::ExactDuplicate {
                    existing_order_id: Some(order.id),
                },
                alternate_origin_code: None,
            },
            _ if earlier.is_some_and(|prev| prev.iter().any(|p| p.matches(fingerprint))) => {
                DuplicateCheck {
                    status: DuplicateStatus::ExactDuplicate {
                        existing_order_id: None,
                    },
                    alternate_origin_code: None,
                }
            }
            None if earlier.is_none() => {
                self.reserved.insert(origin_code.to_string());
                DuplicateCheck::new_order()
            }
            existing => {
                let existing_order_id = existing.map(|o| o.id);
                match self.find_alternate(origin_code, fingerprint).await? {
                    AlternateSlot::Free(code) => {
                        self.reserved.insert(code.clone());
                        DuplicateCheck {
                            status: DuplicateStatus::Conflict { existing_order_id },
                            alternate_origin_code: Some(code),
                        }
                    }
                    // The resubmission was already committed under an alternate code.
                    AlternateSlot::Committed(order_id) => DuplicateCheck {
                        status: DuplicateStatus::ExactDuplicate {
                            existing_order_id: Some(order_id),
                        },
                        alternate_origin_code: None,
                    },
                }
            }
        };

        self.seen
            .entry(origin_code.to_string())
            .or_default()
            .push(fingerprint.clone());

        match &check.status {
            DuplicateStatus::New => {}
            DuplicateStatus::ExactDuplicate { .. } => {
                info!(origin_code, "Exact duplicate detected");
            }
            DuplicateStatus::Conflict { .. } => {
                info!(
                    origin_code,
                    alternate = ?check.alternate_origin_code,
                    "Conflicting resubmission detected"
                );
            }
        }
        Ok(check)
    }

    /// Like `check`, but an exhausted alternate range becomes a conflict
    /// without a code instead of an error.
    pub async fn check_lenient(
        &mut self,
        origin_code: &str,
        fingerprint: &OrderFingerprint,
    ) -> Result<DuplicateCheck, DatabaseError> {
        match self.check(origin_code, fingerprint).await {
            Ok(check) => Ok(check),
            Err(PipelineError::AlternateCodeExhausted { .. }) => {
                self.seen
                    .entry(origin_code.to_string())
                    .or_default()
                    .push(fingerprint.clone());
                Ok(DuplicateCheck {
                    status: DuplicateStatus::Conflict {
                        existing_order_id: None,
                    },
                    alternate_origin_code: None,
                })
            }
            Err(PipelineError::Persistence(e)) => Err(e),
            Err(other) => Err(DatabaseError::Query(other.to_string())),
        }
    }

    async fn find_alternate(
        &self,
        origin_code: &str,
        fingerprint: &OrderFingerprint,
    ) -> Result<AlternateSlot, PipelineError> {
        for attempt in 1..=MAX_ALTERNATE_ATTEMPTS {
            let code = alternate_code(origin_code, attempt);
            if self.reserved.contains(&code) {
                continue;
            }
            match self.store.find_order_by_origin_code(&code).await? {
                None => {
                    debug!(origin_code, alternate = %code, attempt, "Alternate code is free");
                    return Ok(AlternateSlot::Free(code));
                }
                Some(order) if OrderFingerprint::from(&order).matches(fingerprint) => {
                    return Ok(AlternateSlot::Committed(order.id));
                }
                Some(_) => {}
            }
        }
        Err(PipelineError::AlternateCodeExhausted {
            origin_code: origin_code.to_string(),
            attempts: MAX_ALTERNATE_ATTEMPTS,
        })
    }
}

enum AlternateSlot {
    Free(String),
    Committed(String),
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::pipeline::types::ConfirmationState;
    use crate::store::{AuditEntry, LibSqlBackend, NewCustomer, NewOrder, UnitOfWork};

    fn fp(reference: &str, total: Decimal) -> OrderFingerprint {
        OrderFingerprint {
            internal_reference_number: Some(reference.into()),
            customer_id: Some("c1".into()),
            total,
        }
    }

    async fn store_with_orders(orders: &[(&str, &str, Decimal)]) -> LibSqlBackend {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let mut unit = db.begin_unit().await.unwrap();
        let customer = unit
            .create_customer(&NewCustomer {
                code: "C1".into(),
                tax_id: "1-9".into(),
                legal_name: "Uno".into(),
                address: String::new(),
                district: String::new(),
            })
            .await
            .unwrap();
        for (code, reference, total) in orders {
            unit.create_order(
                &NewOrder {
                    origin_code: code.to_string(),
                    internal_reference_number: Some(reference.to_string()),
                    customer_id: customer.id.clone(),
                    message_date: Utc::now(),
                    confirmation_state: ConfirmationState::Confirmed,
                    shipment_type: String::new(),
                    carrier: String::new(),
                    net: *total,
                    tax: Decimal::ZERO,
                    total: *total,
                    archived_document_path: None,
                },
                &[],
                &AuditEntry {
                    state: "in_review".into(),
                    actor: "test".into(),
                    note: String::new(),
                },
            )
            .await
            .unwrap();
        }
        unit.commit().await.unwrap();
        db
    }

    async fn customer_id(db: &LibSqlBackend) -> String {
        db.find_customer_by_tax_id("1-9").await.unwrap().unwrap().id
    }

    #[test]
    fn alternate_code_sequence() {
        assert_eq!(alternate_code("OC-1", 1), "OC-1-R");
        assert_eq!(alternate_code("OC-1", 2), "OC-1-R2");
        assert_eq!(alternate_code("OC-1", 99), "OC-1-R99");
    }

    #[test]
    fn tolerance_is_one_cent() {
        assert!(fp("1", dec!(100.00)).matches(&fp("1", dec!(100.01))));
        assert!(!fp("1", dec!(100.00)).matches(&fp("1", dec!(100.02))));
        assert!(!fp("1", dec!(100)).matches(&fp("2", dec!(100))));
    }

    #[tokio::test]
    async fn new_exact_and_conflict() {
        let db = store_with_orders(&[("OC-1", "88", dec!(2380))]).await;
        let cid = customer_id(&db).await;
        let mut detector = DuplicateDetector::new(&db);

        let same = OrderFingerprint {
            customer_id: Some(cid.clone()),
            ..fp("88", dec!(2380))
        };
        let check = detector.check("OC-1", &same).await.unwrap();
        assert!(check.status.is_exact());

        let different = OrderFingerprint {
            customer_id: Some(cid.clone()),
            ..fp("88", dec!(4760))
        };
        let mut detector = DuplicateDetector::new(&db);
        let check = detector.check("OC-1", &different).await.unwrap();
        assert!(check.status.is_conflict());
        assert_eq!(check.alternate_origin_code.as_deref(), Some("OC-1-R"));

        let check = detector.check("OC-2", &different).await.unwrap();
        assert_eq!(check.status, DuplicateStatus::New);
    }

    #[tokio::test]
    async fn probing_skips_taken_codes() {
        let db = store_with_orders(&[
            ("OC-1", "88", dec!(100)),
            ("OC-1-R", "88", dec!(200)),
            ("OC-1-R2", "88", dec!(300)),
        ])
        .await;
        let cid = customer_id(&db).await;
        let mut detector = DuplicateDetector::new(&db);
        let fingerprint = OrderFingerprint {
            customer_id: Some(cid),
            ..fp("88", dec!(400))
        };
        let check = detector.check("OC-1", &fingerprint).await.unwrap();
        assert_eq!(check.alternate_origin_code.as_deref(), Some("OC-1-R3"));
    }

    #[tokio::test]
    async fn committed_alternate_is_an_exact_duplicate() {
        let db = store_with_orders(&[("OC-1", "88", dec!(100)), ("OC-1-R", "88", dec!(200))]).await;
        let cid = customer_id(&db).await;
        let mut detector = DuplicateDetector::new(&db);
        let fingerprint = OrderFingerprint {
            customer_id: Some(cid),
            ..fp("88", dec!(200))
        };
        let check = detector.check("OC-1", &fingerprint).await.unwrap();
        assert!(check.status.is_exact());
        assert!(check.alternate_origin_code.is_none());
    }

    #[tokio::test]
    async fn within_run_candidates_are_compared() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let mut detector = DuplicateDetector::new(&db);

        let first = detector.check("OC-9", &fp("1", dec!(10))).await.unwrap();
        assert_eq!(first.status, DuplicateStatus::New);

        let repeat = detector.check("OC-9", &fp("1", dec!(10))).await.unwrap();
        assert!(repeat.status.is_exact());

        let changed = detector.check("OC-9", &fp("1", dec!(20))).await.unwrap();
        assert_eq!(
            changed.status,
            DuplicateStatus::Conflict {
                existing_order_id: None
            }
        );
        assert_eq!(changed.alternate_origin_code.as_deref(), Some("OC-9-R"));

        let changed_again = detector.check("OC-9", &fp("1", dec!(30))).await.unwrap();
        assert_eq!(changed_again.alternate_origin_code.as_deref(), Some("OC-9-R2"));
    }

    #[tokio::test]
    async fn exhausted_range_is_lenient_conflict() {
        let mut orders = vec![("OC-1".to_string(), dec!(1))];
        for attempt in 1..=MAX_ALTERNATE_ATTEMPTS {
            orders.push((alternate_code("OC-1", attempt), Decimal::from(attempt + 1)));
        }
        let refs: Vec<(&str, &str, Decimal)> =
            orders.iter().map(|(c, t)| (c.as_str(), "88", *t)).collect();
        let db = store_with_orders(&refs).await;

        let mut detector = DuplicateDetector::new(&db);
        let err = detector.check("OC-1", &fp("77", dec!(5000))).await.unwrap_err();
        assert!(matches!(err, PipelineError::AlternateCodeExhausted { attempts: 99, .. }));

        let mut detector = DuplicateDetector::new(&db);
        let check = detector
            .check_lenient("OC-1", &fp("77", dec!(5000)))
            .await
            .unwrap();
        assert!(check.status.is_conflict());
        assert!(check.alternate_origin_code.is_none());
    }
}
