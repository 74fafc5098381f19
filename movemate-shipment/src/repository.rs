use async_trait::async_trait;
use movemate_core::CoreError;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::billing::{Billing, BillingState};
use crate::models::{AccountStatus, CustomerAccount, Shipment, Transaction, TransactionOwner, TransactionRefType};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {id} was modified concurrently")]
    VersionConflict { entity: &'static str, id: String },

    #[error("Credit limit exceeded for customer {0}")]
    CreditLimitExceeded(Uuid),

    #[error("{entity} not found: {id}")]
    Missing { entity: &'static str, id: String },

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict { id, .. } => CoreError::Conflict(id),
            StoreError::CreditLimitExceeded(_) => CoreError::insufficient_funds("CREDIT_LIMIT_EXCEEDED", err.to_string()),
            StoreError::Missing { entity, id } => CoreError::not_found(entity, id),
            StoreError::Backend(msg) => CoreError::ExternalFailure(msg),
        }
    }
}

/// A document together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: i64,
}

/// Atomic adjustment of a customer's credit ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditDelta {
    pub customer_id: Uuid,
    pub usage_delta: i64,
    pub outstanding_delta: i64,
    /// Refuse the change if usage would exceed the credit limit.
    pub enforce_limit: bool,
}

/// Everything one handler writes, applied all-or-nothing.
///
/// Documents carry the version they were read at (`None` for inserts);
/// a mismatch aborts the whole set with `VersionConflict`.
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub shipments: Vec<(Shipment, Option<i64>)>,
    pub billings: Vec<(Billing, Option<i64>)>,
    pub credit: Vec<CreditDelta>,
    pub account_status: Vec<(Uuid, AccountStatus)>,
    pub transactions: Vec<Transaction>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_shipment(&mut self, shipment: Shipment, expected_version: Option<i64>) -> &mut Self {
        self.shipments.push((shipment, expected_version));
        self
    }

    pub fn put_billing(&mut self, billing: Billing, expected_version: Option<i64>) -> &mut Self {
        self.billings.push((billing, expected_version));
        self
    }

    pub fn adjust_credit(&mut self, delta: CreditDelta) -> &mut Self {
        self.credit.push(delta);
        self
    }

    pub fn set_account_status(&mut self, customer_id: Uuid, status: AccountStatus) -> &mut Self {
        self.account_status.push((customer_id, status));
        self
    }

    pub fn record_transaction(&mut self, transaction: Transaction) -> &mut Self {
        self.transactions.push(transaction);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.shipments.is_empty()
            && self.billings.is_empty()
            && self.credit.is_empty()
            && self.account_status.is_empty()
            && self.transactions.is_empty()
    }
}

#[async_trait]
pub trait LifecycleStore: Send + Sync {
    async fn shipment(&self, tracking_number: &str) -> Result<Option<Versioned<Shipment>>, StoreError>;

    async fn billing(&self, billing_number: &str) -> Result<Option<Versioned<Billing>>, StoreError>;

    async fn account(&self, customer_id: Uuid) -> Result<Option<CustomerAccount>, StoreError>;

    async fn billings_in_state(&self, state: BillingState) -> Result<Vec<Versioned<Billing>>, StoreError>;

    /// Credit shipments a billing cycle still has to invoice.
    async fn unbilled_credit_shipments(
        &self,
        customer_id: Option<Uuid>,
    ) -> Result<Vec<Versioned<Shipment>>, StoreError>;

    /// Live shipments still looking for a driver.
    async fn shipments_awaiting_driver(&self) -> Result<Vec<Versioned<Shipment>>, StoreError>;

    async fn transactions_for(&self, tracking_number: &str) -> Result<Vec<Transaction>, StoreError>;

    /// Apply a change set atomically. Duplicate transactions are skipped.
    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError>;
}

type TransactionKey = (String, TransactionRefType, TransactionOwner);

#[derive(Default)]
struct MemoryState {
    shipments: HashMap<String, Versioned<Shipment>>,
    billings: HashMap<String, Versioned<Billing>>,
    accounts: HashMap<Uuid, CustomerAccount>,
    transactions: Vec<Transaction>,
    transaction_keys: HashSet<TransactionKey>,
}

/// In-memory store; a single lock makes every commit atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_account(&self, account: CustomerAccount) {
        self.state.lock().await.accounts.insert(account.id, account);
    }
}

fn check_version(
    entity: &'static str,
    id: &str,
    current: Option<i64>,
    expected: Option<i64>,
) -> Result<(), StoreError> {
    if current == expected {
        Ok(())
    } else {
        Err(StoreError::VersionConflict {
            entity,
            id: id.to_string(),
        })
    }
}

#[async_trait]
impl LifecycleStore for MemoryStore {
    async fn shipment(&self, tracking_number: &str) -> Result<Option<Versioned<Shipment>>, StoreError> {
        Ok(self.state.lock().await.shipments.get(tracking_number).cloned())
    }

    async fn billing(&self, billing_number: &str) -> Result<Option<Versioned<Billing>>, StoreError> {
        Ok(self.state.lock().await.billings.get(billing_number).cloned())
    }

    async fn account(&self, customer_id: Uuid) -> Result<Option<CustomerAccount>, StoreError> {
        Ok(self.state.lock().await.accounts.get(&customer_id).cloned())
    }

    async fn billings_in_state(&self, state: BillingState) -> Result<Vec<Versioned<Billing>>, StoreError> {
        let guard = self.state.lock().await;
        let mut billings: Vec<_> = guard
            .billings
            .values()
            .filter(|b| b.value.state == state)
            .cloned()
            .collect();
        billings.sort_by(|a, b| a.value.billing_number.cmp(&b.value.billing_number));
        Ok(billings)
    }

    async fn unbilled_credit_shipments(
        &self,
        customer_id: Option<Uuid>,
    ) -> Result<Vec<Versioned<Shipment>>, StoreError> {
        let guard = self.state.lock().await;
        let mut shipments: Vec<_> = guard
            .shipments
            .values()
            .filter(|s| s.value.awaits_credit_billing())
            .filter(|s| customer_id.map(|id| s.value.customer_id == id).unwrap_or(true))
            .cloned()
            .collect();
        shipments.sort_by(|a, b| a.value.tracking_number.cmp(&b.value.tracking_number));
        Ok(shipments)
    }

    async fn shipments_awaiting_driver(&self) -> Result<Vec<Versioned<Shipment>>, StoreError> {
        let guard = self.state.lock().await;
        let mut shipments: Vec<_> = guard
            .shipments
            .values()
            .filter(|s| s.value.awaits_driver())
            .cloned()
            .collect();
        shipments.sort_by(|a, b| a.value.tracking_number.cmp(&b.value.tracking_number));
        Ok(shipments)
    }

    async fn transactions_for(&self, tracking_number: &str) -> Result<Vec<Transaction>, StoreError> {
        let guard = self.state.lock().await;
        Ok(guard
            .transactions
            .iter()
            .filter(|t| t.tracking_number == tracking_number)
            .cloned()
            .collect())
    }

    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;

        // Validate everything before touching anything.
        for (shipment, expected) in &changes.shipments {
            let current = state.shipments.get(&shipment.tracking_number).map(|v| v.version);
            check_version("shipment", &shipment.tracking_number, current, *expected)?;
        }
        for (billing, expected) in &changes.billings {
            let current = state.billings.get(&billing.billing_number).map(|v| v.version);
            check_version("billing", &billing.billing_number, current, *expected)?;
        }
        let mut projected: HashMap<Uuid, (i64, i64)> = HashMap::new();
        for delta in &changes.credit {
            let account = state.accounts.get(&delta.customer_id).ok_or_else(|| StoreError::Missing {
                entity: "customer",
                id: delta.customer_id.to_string(),
            })?;
            let entry = projected
                .entry(delta.customer_id)
                .or_insert((account.credit_usage, account.credit_limit));
            entry.0 += delta.usage_delta;
            if delta.enforce_limit && delta.usage_delta > 0 && entry.0 > entry.1 {
                return Err(StoreError::CreditLimitExceeded(delta.customer_id));
            }
        }
        for (customer_id, _) in &changes.account_status {
            if !state.accounts.contains_key(customer_id) {
                return Err(StoreError::Missing {
                    entity: "customer",
                    id: customer_id.to_string(),
                });
            }
        }

        for (shipment, expected) in changes.shipments {
            let version = expected.map(|v| v + 1).unwrap_or(1);
            state
                .shipments
                .insert(shipment.tracking_number.clone(), Versioned { value: shipment, version });
        }
        for (billing, expected) in changes.billings {
            let version = expected.map(|v| v + 1).unwrap_or(1);
            state
                .billings
                .insert(billing.billing_number.clone(), Versioned { value: billing, version });
        }
        for delta in changes.credit {
            if let Some(account) = state.accounts.get_mut(&delta.customer_id) {
                account.credit_usage += delta.usage_delta;
                account.credit_outstanding_balance += delta.outstanding_delta;
            }
        }
        for (customer_id, status) in changes.account_status {
            if let Some(account) = state.accounts.get_mut(&customer_id) {
                account.status = status;
            }
        }
        for transaction in changes.transactions {
            if state.transaction_keys.insert(transaction.key()) {
                state.transactions.push(transaction);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PaymentMethod;
    use chrono::Utc;

    #[tokio::test]
    async fn test_credit_limit_enforced_atomically() {
        let store = MemoryStore::new();
        let customer = CustomerAccount::new(Uuid::new_v4(), 1000, false);
        store.insert_account(customer.clone()).await;

        let mut changes = ChangeSet::new();
        changes.adjust_credit(CreditDelta {
            customer_id: customer.id,
            usage_delta: 1200,
            outstanding_delta: 0,
            enforce_limit: true,
        });
        let err = store.commit(changes).await.unwrap_err();
        assert!(matches!(err, StoreError::CreditLimitExceeded(_)));
        assert_eq!(CoreError::from(err).code(), "CREDIT_LIMIT_EXCEEDED");

        let account = store.account(customer.id).await.unwrap().unwrap();
        assert_eq!(account.credit_usage, 0);
    }

    #[tokio::test]
    async fn test_duplicate_transactions_skipped() {
        let store = MemoryStore::new();
        let tx = || {
            Transaction::new(
                "MM0001",
                TransactionRefType::ShipmentIncome,
                TransactionOwner::Operator,
                200,
                "income",
                Utc::now(),
            )
        };
        let mut first = ChangeSet::new();
        first.record_transaction(tx());
        store.commit(first).await.unwrap();
        let mut second = ChangeSet::new();
        second.record_transaction(tx());
        store.commit(second).await.unwrap();

        assert_eq!(store.transactions_for("MM0001").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_account_rejects_status_change() {
        let store = MemoryStore::new();
        let mut changes = ChangeSet::new();
        changes.set_account_status(Uuid::new_v4(), AccountStatus::Banned);
        assert!(matches!(store.commit(changes).await, Err(StoreError::Missing { .. })));
    }

    #[tokio::test]
    async fn test_stale_version_aborts_whole_commit() {
        let store = MemoryStore::new();
        let customer = CustomerAccount::new(Uuid::new_v4(), 1000, false);
        store.insert_account(customer.clone()).await;

        let billing = Billing::issue("MM0002", customer.id, PaymentMethod::Cash, 500, None, Utc::now());
        let mut insert = ChangeSet::new();
        insert.put_billing(billing, None);
        store.commit(insert).await.unwrap();
        let read = store.billing("MM0002").await.unwrap().unwrap();
        assert_eq!(read.version, 1);

        // Two writers start from the same read.
        let mut first = ChangeSet::new();
        let mut winner = read.value.clone();
        winner.amount = 600;
        first.put_billing(winner, Some(read.version));
        store.commit(first).await.unwrap();

        let mut second = ChangeSet::new();
        let mut loser = read.value.clone();
        loser.amount = 700;
        second
            .put_billing(loser, Some(read.version))
            .set_account_status(customer.id, AccountStatus::Banned)
            .adjust_credit(CreditDelta {
                customer_id: customer.id,
                usage_delta: 100,
                outstanding_delta: 0,
                enforce_limit: true,
            });
        let err = store.commit(second).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { entity: "billing", .. }));
        assert_eq!(CoreError::from(err).code(), "CONCURRENT_MODIFICATION");

        let stored = store.billing("MM0002").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.value.amount, 600);
        let account = store.account(customer.id).await.unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::Active);
        assert_eq!(account.credit_usage, 0);
    }
}
