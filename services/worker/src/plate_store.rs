use crate::config::DatabaseConfig;
use crate::plate::{PlateObservation, PlateRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info, instrument};

const PLATE_COLUMNS: &str = r#"
    id, plate_number, capture_time, recent_capture_time, image_url, video_url, video_captured_at,
    car_make, car_color, fuel_type, mot_status, tax_status,
    mot_expiry_date, tax_due_date, year_of_manufacture, month_of_first_registration,
    created_at, updated_at
"#;

/// Persistence for plate records and the last-update marker.
#[async_trait]
pub trait PlateStore: Send + Sync {
    /// Insert or update the record for an observation and bump the
    /// last-update marker, atomically.
    async fn record_observation(&self, observation: &PlateObservation) -> Result<PlateRecord>;

    /// Point a plate's record at the clip cut for the event at `event_time`.
    ///
    /// Returns false if the plate has no record or already references a clip
    /// of a later event.
    async fn attach_video(
        &self,
        plate: &str,
        filename: &str,
        event_time: DateTime<Utc>,
    ) -> Result<bool>;

    /// Fetch the record for a normalized plate.
    async fn get_plate(&self, plate: &str) -> Result<Option<PlateRecord>>;

    /// Time of the last successful change to plate data.
    async fn last_update(&self) -> Result<Option<DateTime<Utc>>>;

    /// Check connectivity to the backing store.
    async fn ping(&self) -> Result<()>;
}

/// Plate store backed by PostgreSQL
pub struct PgPlateStore {
    pool: PgPool,
}

impl PgPlateStore {
    /// Create a new plate store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

}

async fn touch_marker(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>) -> Result<()> {
    sqlx::query("UPDATE app_state SET last_plate_update = NOW() WHERE id = 1")
        .execute(&mut **tx)
        .await
        .context("Failed to update last-update marker")?;
    Ok(())
}

#[async_trait]
impl PlateStore for PgPlateStore {
    #[instrument(skip(self, observation), fields(plate = %observation.plate))]
    async fn record_observation(&self, observation: &PlateObservation) -> Result<PlateRecord> {
        let attrs = observation.attributes.clone().unwrap_or_default();

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        // Single statement so concurrent sightings of the same plate cannot
        // both insert.
        let record = sqlx::query_as::<_, PlateRecord>(&format!(
            r#"
            INSERT INTO license_plates (
                plate_number, capture_time, recent_capture_time, image_url,
                car_make, car_color, fuel_type, mot_status, tax_status,
                mot_expiry_date, tax_due_date, year_of_manufacture,
                month_of_first_registration
            ) VALUES (
                $1, $2, $2, $3,
                $4, $5, $6, $7, $8,
                $9, $10, $11,
                $12
            )
            ON CONFLICT (plate_number) DO UPDATE SET
                capture_time = LEAST(license_plates.capture_time, EXCLUDED.capture_time),
                recent_capture_time = GREATEST(license_plates.recent_capture_time, EXCLUDED.recent_capture_time),
                image_url = COALESCE(EXCLUDED.image_url, license_plates.image_url),
                car_make = COALESCE(EXCLUDED.car_make, license_plates.car_make),
                car_color = COALESCE(EXCLUDED.car_color, license_plates.car_color),
                fuel_type = COALESCE(EXCLUDED.fuel_type, license_plates.fuel_type),
                mot_status = COALESCE(EXCLUDED.mot_status, license_plates.mot_status),
                tax_status = COALESCE(EXCLUDED.tax_status, license_plates.tax_status),
                mot_expiry_date = COALESCE(EXCLUDED.mot_expiry_date, license_plates.mot_expiry_date),
                tax_due_date = COALESCE(EXCLUDED.tax_due_date, license_plates.tax_due_date),
                year_of_manufacture = COALESCE(EXCLUDED.year_of_manufacture, license_plates.year_of_manufacture),
                month_of_first_registration = COALESCE(EXCLUDED.month_of_first_registration, license_plates.month_of_first_registration),
                updated_at = NOW()
            RETURNING {PLATE_COLUMNS}
            "#
        ))
        .bind(&observation.plate)
        .bind(observation.captured_at)
        .bind(&observation.image)
        .bind(&attrs.make)
        .bind(&attrs.color)
        .bind(&attrs.fuel_type)
        .bind(&attrs.mot_status)
        .bind(&attrs.tax_status)
        .bind(attrs.mot_expiry)
        .bind(attrs.tax_due)
        .bind(attrs.year_of_manufacture)
        .bind(&attrs.first_registration_month)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to upsert plate record")?;

        touch_marker(&mut tx).await?;

        tx.commit().await.context("Failed to commit transaction")?;

        debug!(id = record.id, "Plate record upserted");
        metrics::counter!("lpr.plates.persisted").increment(1);

        Ok(record)
    }

    #[instrument(skip(self))]
    async fn attach_video(
        &self,
        plate: &str,
        filename: &str,
        event_time: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let updated = sqlx::query(
            r#"
            UPDATE license_plates
            SET video_url = $2, video_captured_at = $3, updated_at = NOW()
            WHERE plate_number = $1
              AND (video_captured_at IS NULL OR video_captured_at <= $3)
            "#,
        )
        .bind(plate)
        .bind(filename)
        .bind(event_time)
        .execute(&mut *tx)
        .await
        .context("Failed to attach video")?
        .rows_affected();

        if updated > 0 {
            touch_marker(&mut tx).await?;
        }

        tx.commit().await.context("Failed to commit transaction")?;

        Ok(updated > 0)
    }

    async fn get_plate(&self, plate: &str) -> Result<Option<PlateRecord>> {
        let record = sqlx::query_as::<_, PlateRecord>(&format!(
            "SELECT {PLATE_COLUMNS} FROM license_plates WHERE plate_number = $1"
        ))
        .bind(plate)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query plate")?;

        Ok(record)
    }

    async fn last_update(&self) -> Result<Option<DateTime<Utc>>> {
        let marker: Option<Option<DateTime<Utc>>> =
            sqlx::query_scalar("SELECT last_plate_update FROM app_state WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .context("Failed to read last-update marker")?;

        Ok(marker.flatten())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Database ping failed")?;
        Ok(())
    }
}
