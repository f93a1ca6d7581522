//! Postgres store
//!
//! Database access layer over the three synced tables

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use super::{NewDevice, NewJob, StoreClient};
use crate::change_feed::ScopeFilter;
use crate::error::{Error, Result};
use crate::models::{AnalysisJob, DetectionStatus, Device, JobStatus, Notification, Verdict};

#[derive(Debug, FromRow)]
struct DeviceRow {
    id: String,
    owner_id: String,
    name: String,
    address: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeviceRow> for Device {
    type Error = Error;

    fn try_from(row: DeviceRow) -> Result<Self> {
        Ok(Device {
            id: row.id,
            owner_id: row.owner_id,
            name: row.name,
            address: row.address,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct NotificationRow {
    id: String,
    device_id: String,
    user_id: String,
    message: String,
    timestamp: DateTime<Utc>,
}

impl From<NotificationRow> for Notification {
    fn from(row: NotificationRow) -> Self {
        Notification {
            id: row.id,
            device_id: row.device_id,
            user_id: row.user_id,
            message: row.message,
            timestamp: row.timestamp,
        }
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    user_id: String,
    video_uri: String,
    status: String,
    result: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for AnalysisJob {
    type Error = Error;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(AnalysisJob {
            id: row.id,
            user_id: row.user_id,
            video_uri: row.video_uri,
            status: row.status.parse::<JobStatus>()?,
            result: row.result.as_deref().map(str::parse::<Verdict>).transpose()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn read_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

fn write_err(e: sqlx::Error) -> Error {
    Error::StoreWriteFailed(e.to_string())
}

/// Postgres-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    const DEVICE_COLUMNS: &'static str =
        "id, owner_id, name, address, status, created_at, updated_at";
    const NOTIFICATION_COLUMNS: &'static str = "id, device_id, user_id, message, timestamp";
    const JOB_COLUMNS: &'static str =
        "id, user_id, video_uri, status, result, created_at, updated_at";

    async fn update_device(&self, sql: String, id: &str, value: &str) -> Result<Device> {
        let row = sqlx::query_as::<_, DeviceRow>(&sql)
            .bind(value)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(write_err)?
            .ok_or_else(|| Error::NotFound(format!("device {}", id)))?;

        row.try_into()
    }
}

#[async_trait]
impl StoreClient for PgStore {
    async fn list_devices(&self, owner_id: &str) -> Result<Vec<Device>> {
        let sql = format!(
            "SELECT {} FROM devices WHERE owner_id = $1 ORDER BY created_at DESC",
            Self::DEVICE_COLUMNS
        );
        sqlx::query_as::<_, DeviceRow>(&sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await
            .map_err(read_err)?
            .into_iter()
            .map(Device::try_from)
            .collect()
    }

    async fn get_device(&self, id: &str) -> Result<Option<Device>> {
        let sql = format!("SELECT {} FROM devices WHERE id = $1", Self::DEVICE_COLUMNS);
        sqlx::query_as::<_, DeviceRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err)?
            .map(Device::try_from)
            .transpose()
    }

    async fn insert_device(&self, new: NewDevice) -> Result<Device> {
        let sql = format!(
            "INSERT INTO devices (owner_id, name, address, status) VALUES ($1, $2, $3, $4) RETURNING {}",
            Self::DEVICE_COLUMNS
        );
        let row = sqlx::query_as::<_, DeviceRow>(&sql)
            .bind(&new.owner_id)
            .bind(&new.name)
            .bind(&new.address)
            .bind(DetectionStatus::Stopped.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(write_err)?;

        row.try_into()
    }

    async fn update_device_name(&self, id: &str, name: &str) -> Result<Device> {
        let sql = format!(
            "UPDATE devices SET name = $1 WHERE id = $2 RETURNING {}",
            Self::DEVICE_COLUMNS
        );
        self.update_device(sql, id, name).await
    }

    async fn update_device_status(&self, id: &str, status: DetectionStatus) -> Result<Device> {
        let sql = format!(
            "UPDATE devices SET status = $1 WHERE id = $2 RETURNING {}",
            Self::DEVICE_COLUMNS
        );
        self.update_device(sql, id, status.as_str()).await
    }

    async fn delete_device(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM devices WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(write_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("device {}", id)));
        }
        Ok(())
    }

    async fn list_notifications(&self, filter: &ScopeFilter) -> Result<Vec<Notification>> {
        let (column, value) = match filter {
            ScopeFilter::Owner(user_id) => ("user_id", user_id),
            ScopeFilter::Device(device_id) => ("device_id", device_id),
        };
        let sql = format!(
            "SELECT {} FROM notifications WHERE {} = $1 ORDER BY timestamp DESC",
            Self::NOTIFICATION_COLUMNS,
            column
        );
        let rows = sqlx::query_as::<_, NotificationRow>(&sql)
            .bind(value)
            .fetch_all(&self.pool)
            .await
            .map_err(read_err)?;

        Ok(rows.into_iter().map(Notification::from).collect())
    }

    async fn list_jobs(&self, owner_id: &str) -> Result<Vec<AnalysisJob>> {
        let sql = format!(
            "SELECT {} FROM analysis_jobs WHERE user_id = $1 ORDER BY created_at DESC",
            Self::JOB_COLUMNS
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await
            .map_err(read_err)?
            .into_iter()
            .map(AnalysisJob::try_from)
            .collect()
    }

    async fn get_job(&self, id: &str) -> Result<Option<AnalysisJob>> {
        let sql = format!("SELECT {} FROM analysis_jobs WHERE id = $1", Self::JOB_COLUMNS);
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err)?
            .map(AnalysisJob::try_from)
            .transpose()
    }

    async fn insert_job(&self, new: NewJob) -> Result<AnalysisJob> {
        let sql = format!(
            "INSERT INTO analysis_jobs (user_id, video_uri, status) VALUES ($1, $2, $3) RETURNING {}",
            Self::JOB_COLUMNS
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(&new.user_id)
            .bind(&new.video_uri)
            .bind(JobStatus::Pending.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(write_err)?;

        row.try_into()
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
