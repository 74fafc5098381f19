use async_trait::async_trait;
use movemate_shipment::billing::{Billing, BillingState};
use movemate_shipment::models::{AccountStatus, CustomerAccount, Shipment, Transaction, TransactionOwner};
use movemate_shipment::repository::{ChangeSet, LifecycleStore, StoreError, Versioned};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction as PgTransaction};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct DbClient {
    pub pool: PgPool,
}

impl DbClient {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect(connection_string)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations...");
        sqlx::migrate!("../migrations").run(&self.pool).await?;
        info!("Migrations completed successfully.");
        Ok(())
    }
}

// ============================================================================
// Postgres lifecycle store
// ============================================================================
//
// Shipments and billings are JSONB documents with a `version` column. A
// write names the version it read; zero affected rows means someone else
// got there first. Credit counters are only changed with `x = x + $delta`.
//
// ============================================================================

pub struct PgLifecycleStore {
    pool: PgPool,
}

impl PgLifecycleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    document: Value,
    version: i64,
}

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    status: String,
    credit_limit: i64,
    credit_usage: i64,
    credit_outstanding_balance: i64,
    is_business: bool,
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    tracking_number: String,
    ref_type: String,
    owner: Value,
    amount: i64,
    description: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Backend(format!("corrupt document: {}", e)))
}

fn encode<T: Serialize>(value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Backend(format!("unencodable document: {}", e)))
}

/// Wire name of a unit enum, e.g. `BillingState::Overdue` → `OVERDUE`.
fn as_text<T: Serialize>(value: &T) -> Result<String, StoreError> {
    match encode(value)? {
        Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

fn owner_key(owner: &TransactionOwner) -> String {
    match owner {
        TransactionOwner::Operator => "OPERATOR".to_string(),
        TransactionOwner::Driver(id) => format!("DRIVER:{}", id),
        TransactionOwner::Customer(id) => format!("CUSTOMER:{}", id),
    }
}

fn versioned<T: DeserializeOwned>(row: DocumentRow) -> Result<Versioned<T>, StoreError> {
    Ok(Versioned {
        value: decode(row.document)?,
        version: row.version,
    })
}

impl TryFrom<AccountRow> for CustomerAccount {
    type Error = StoreError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        let status: AccountStatus = decode(Value::String(row.status))?;
        Ok(CustomerAccount {
            id: row.id,
            status,
            credit_limit: row.credit_limit,
            credit_usage: row.credit_usage,
            credit_outstanding_balance: row.credit_outstanding_balance,
            is_business: row.is_business,
        })
    }
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(Transaction {
            id: row.id,
            tracking_number: row.tracking_number,
            ref_type: decode(Value::String(row.ref_type))?,
            owner: decode(row.owner)?,
            amount: row.amount,
            description: row.description,
            created_at: row.created_at,
        })
    }
}

async fn put_shipment(
    tx: &mut PgTransaction<'_, Postgres>,
    shipment: &Shipment,
    expected: Option<i64>,
) -> Result<(), StoreError> {
    let document = encode(shipment)?;
    let status = as_text(&shipment.status)?;
    let payment_method = as_text(&shipment.payment_method)?;

    let result = match expected {
        Some(version) => {
            sqlx::query(
                r#"
                UPDATE shipments
                SET document = $2, status = $3, is_billed = $4, version = version + 1, updated_at = NOW()
                WHERE tracking_number = $1 AND version = $5
                "#,
            )
            .bind(&shipment.tracking_number)
            .bind(&document)
            .bind(&status)
            .bind(shipment.is_billed)
            .bind(version)
            .execute(&mut **tx)
            .await
        }
        None => {
            sqlx::query(
                r#"
                INSERT INTO shipments (tracking_number, customer_id, status, payment_method, is_billed, document, version)
                VALUES ($1, $2, $3, $4, $5, $6, 1)
                ON CONFLICT (tracking_number) DO NOTHING
                "#,
            )
            .bind(&shipment.tracking_number)
            .bind(shipment.customer_id)
            .bind(&status)
            .bind(&payment_method)
            .bind(shipment.is_billed)
            .bind(&document)
            .execute(&mut **tx)
            .await
        }
    }
    .map_err(backend)?;

    if result.rows_affected() == 0 {
        return Err(StoreError::VersionConflict {
            entity: "shipment",
            id: shipment.tracking_number.clone(),
        });
    }
    Ok(())
}

async fn put_billing(
    tx: &mut PgTransaction<'_, Postgres>,
    billing: &Billing,
    expected: Option<i64>,
) -> Result<(), StoreError> {
    let document = encode(billing)?;
    let state = as_text(&billing.state)?;

    let result = match expected {
        Some(version) => {
            sqlx::query(
                r#"
                UPDATE billings
                SET document = $2, state = $3, version = version + 1, updated_at = NOW()
                WHERE billing_number = $1 AND version = $4
                "#,
            )
            .bind(&billing.billing_number)
            .bind(&document)
            .bind(&state)
            .bind(version)
            .execute(&mut **tx)
            .await
        }
        None => {
            sqlx::query(
                r#"
                INSERT INTO billings (billing_number, customer_id, state, document, version)
                VALUES ($1, $2, $3, $4, 1)
                ON CONFLICT (billing_number) DO NOTHING
                "#,
            )
            .bind(&billing.billing_number)
            .bind(billing.customer_id)
            .bind(&state)
            .bind(&document)
            .execute(&mut **tx)
            .await
        }
    }
    .map_err(backend)?;

    if result.rows_affected() == 0 {
        return Err(StoreError::VersionConflict {
            entity: "billing",
            id: billing.billing_number.clone(),
        });
    }
    Ok(())
}

#[async_trait]
impl LifecycleStore for PgLifecycleStore {
    async fn shipment(&self, tracking_number: &str) -> Result<Option<Versioned<Shipment>>, StoreError> {
        let row: Option<DocumentRow> =
            sqlx::query_as("SELECT document, version FROM shipments WHERE tracking_number = $1")
                .bind(tracking_number)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        row.map(versioned).transpose()
    }

    async fn billing(&self, billing_number: &str) -> Result<Option<Versioned<Billing>>, StoreError> {
        let row: Option<DocumentRow> =
            sqlx::query_as("SELECT document, version FROM billings WHERE billing_number = $1")
                .bind(billing_number)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        row.map(versioned).transpose()
    }

    async fn account(&self, customer_id: Uuid) -> Result<Option<CustomerAccount>, StoreError> {
        let row: Option<AccountRow> = sqlx::query_as(
            r#"
            SELECT id, status, credit_limit, credit_usage, credit_outstanding_balance, is_business
            FROM customer_accounts WHERE id = $1
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(CustomerAccount::try_from).transpose()
    }

    async fn billings_in_state(&self, state: BillingState) -> Result<Vec<Versioned<Billing>>, StoreError> {
        let rows: Vec<DocumentRow> =
            sqlx::query_as("SELECT document, version FROM billings WHERE state = $1 ORDER BY billing_number")
                .bind(as_text(&state)?)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
        rows.into_iter().map(versioned).collect()
    }

    async fn unbilled_credit_shipments(
        &self,
        customer_id: Option<Uuid>,
    ) -> Result<Vec<Versioned<Shipment>>, StoreError> {
        let rows: Vec<DocumentRow> = sqlx::query_as(
            r#"
            SELECT document, version FROM shipments
            WHERE payment_method = 'CREDIT'
              AND NOT is_billed
              AND status IN ('DELIVERED', 'CANCELLED')
              AND ($1::uuid IS NULL OR customer_id = $1)
            ORDER BY tracking_number
            "#,
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut shipments = Vec::with_capacity(rows.len());
        for row in rows {
            let shipment: Versioned<Shipment> = versioned(row)?;
            if shipment.value.awaits_credit_billing() {
                shipments.push(shipment);
            }
        }
        Ok(shipments)
    }

    async fn shipments_awaiting_driver(&self) -> Result<Vec<Versioned<Shipment>>, StoreError> {
        let rows: Vec<DocumentRow> = sqlx::query_as(
            r#"
            SELECT document, version FROM shipments
            WHERE status IN ('IDLE', 'PROGRESSING')
              AND document->>'driver_acceptance_status' IN ('IDLE', 'PENDING')
            ORDER BY tracking_number
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut shipments = Vec::with_capacity(rows.len());
        for row in rows {
            let shipment: Versioned<Shipment> = versioned(row)?;
            if shipment.value.awaits_driver() {
                shipments.push(shipment);
            }
        }
        Ok(shipments)
    }

    async fn transactions_for(&self, tracking_number: &str) -> Result<Vec<Transaction>, StoreError> {
        let rows: Vec<TransactionRow> = sqlx::query_as(
            r#"
            SELECT id, tracking_number, ref_type, owner, amount, description, created_at
            FROM transactions WHERE tracking_number = $1 ORDER BY created_at
            "#,
        )
        .bind(tracking_number)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.into_iter().map(Transaction::try_from).collect()
    }

    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        // Dropping `tx` on an early return rolls everything back.
        let mut tx = self.pool.begin().await.map_err(backend)?;

        for (shipment, expected) in &changes.shipments {
            put_shipment(&mut tx, shipment, *expected).await?;
        }
        for (billing, expected) in &changes.billings {
            put_billing(&mut tx, billing, *expected).await?;
        }

        for delta in &changes.credit {
            let result = sqlx::query(
                r#"
                UPDATE customer_accounts
                SET credit_usage = credit_usage + $2,
                    credit_outstanding_balance = credit_outstanding_balance + $3,
                    updated_at = NOW()
                WHERE id = $1
                  AND (NOT $4 OR $2 <= 0 OR credit_usage + $2 <= credit_limit)
                "#,
            )
            .bind(delta.customer_id)
            .bind(delta.usage_delta)
            .bind(delta.outstanding_delta)
            .bind(delta.enforce_limit)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

            if result.rows_affected() == 0 {
                let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM customer_accounts WHERE id = $1")
                    .bind(delta.customer_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(backend)?;
                return Err(match exists {
                    Some(_) => StoreError::CreditLimitExceeded(delta.customer_id),
                    None => StoreError::Missing {
                        entity: "customer",
                        id: delta.customer_id.to_string(),
                    },
                });
            }
        }

        for (customer_id, status) in &changes.account_status {
            let result = sqlx::query("UPDATE customer_accounts SET status = $2, updated_at = NOW() WHERE id = $1")
                .bind(customer_id)
                .bind(as_text(status)?)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
            if result.rows_affected() == 0 {
                return Err(StoreError::Missing {
                    entity: "customer",
                    id: customer_id.to_string(),
                });
            }
        }

        for transaction in &changes.transactions {
            sqlx::query(
                r#"
                INSERT INTO transactions (id, tracking_number, ref_type, owner, owner_key, amount, description, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (tracking_number, ref_type, owner_key) DO NOTHING
                "#,
            )
            .bind(transaction.id)
            .bind(&transaction.tracking_number)
            .bind(as_text(&transaction.ref_type)?)
            .bind(encode(&transaction.owner)?)
            .bind(owner_key(&transaction.owner))
            .bind(transaction.amount)
            .bind(&transaction.description)
            .bind(transaction.created_at)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        tx.commit().await.map_err(backend)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use movemate_shipment::models::{ShipmentStatus, TransactionRefType};

    #[test]
    fn test_enum_columns_use_wire_names() {
        assert_eq!(as_text(&BillingState::Overdue).unwrap(), "OVERDUE");
        assert_eq!(as_text(&ShipmentStatus::Delivered).unwrap(), "DELIVERED");
        assert_eq!(as_text(&TransactionRefType::DriverCompensation).unwrap(), "DRIVER_COMPENSATION");
    }

    #[test]
    fn test_owner_key_distinguishes_parties() {
        let id = Uuid::new_v4();
        assert_eq!(owner_key(&TransactionOwner::Operator), "OPERATOR");
        assert_ne!(owner_key(&TransactionOwner::Driver(id)), owner_key(&TransactionOwner::Customer(id)));
    }

    #[test]
    fn test_account_row_decodes_status() {
        let row = AccountRow {
            id: Uuid::new_v4(),
            status: "BANNED".to_string(),
            credit_limit: 10_000,
            credit_usage: 2_500,
            credit_outstanding_balance: 1_000,
            is_business: true,
        };
        let account = CustomerAccount::try_from(row).unwrap();
        assert_eq!(account.status, AccountStatus::Banned);
        assert_eq!(account.credit_usage, 2_500);

        let bad = AccountRow {
            id: Uuid::new_v4(),
            status: "FROZEN".to_string(),
            credit_limit: 0,
            credit_usage: 0,
            credit_outstanding_balance: 0,
            is_business: false,
        };
        assert!(matches!(CustomerAccount::try_from(bad), Err(StoreError::Backend(_))));
    }
}
