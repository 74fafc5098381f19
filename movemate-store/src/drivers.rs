use async_trait::async_trait;
use movemate_core::drivers::{DriverContact, DriverDirectory};
use movemate_core::{CoreError, CoreResult};
use sqlx::PgPool;
use uuid::Uuid;

/// Drivers who are online and not on a job, from the `drivers` table.
pub struct PgDriverDirectory {
    pool: PgPool,
}

impl PgDriverDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct DriverRow {
    id: Uuid,
    fcm_token: Option<String>,
}

impl From<DriverRow> for DriverContact {
    fn from(row: DriverRow) -> Self {
        DriverContact {
            driver_id: row.id,
            fcm_token: row.fcm_token,
        }
    }
}

fn lookup_failed(err: sqlx::Error) -> CoreError {
    CoreError::ExternalFailure(format!("driver lookup failed: {}", err))
}

#[async_trait]
impl DriverDirectory for PgDriverDirectory {
    async fn available_drivers(&self, vehicle_type_id: &str) -> CoreResult<Vec<DriverContact>> {
        let rows: Vec<DriverRow> = sqlx::query_as(
            r#"
            SELECT id, fcm_token FROM drivers
            WHERE vehicle_type_id = $1 AND is_online AND NOT is_busy AND status = 'ACTIVE'
            ORDER BY last_seen_at DESC
            "#,
        )
        .bind(vehicle_type_id)
        .fetch_all(&self.pool)
        .await
        .map_err(lookup_failed)?;
        Ok(rows.into_iter().map(DriverContact::from).collect())
    }

    async fn find_available(&self, driver_id: Uuid) -> CoreResult<Option<DriverContact>> {
        let row: Option<DriverRow> = sqlx::query_as(
            "SELECT id, fcm_token FROM drivers WHERE id = $1 AND is_online AND NOT is_busy AND status = 'ACTIVE'",
        )
        .bind(driver_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(lookup_failed)?;
        Ok(row.map(DriverContact::from))
    }
}
