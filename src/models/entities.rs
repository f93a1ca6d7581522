//! Entities owned by the authoritative store
//!
//! Devices, notifications and analysis jobs as this layer observes them.
//! Status enums travel as lowercase strings both on the wire and in the
//! store, matching what the detector service writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Entity kinds tracked by the sync layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Device,
    Notification,
    AnalysisJob,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [Self::Device, Self::Notification, Self::AnalysisJob];

    /// Store table backing this entity type
    pub fn table_name(&self) -> &'static str {
        match self {
            Self::Device => "devices",
            Self::Notification => "notifications",
            Self::AnalysisJob => "analysis_jobs",
        }
    }

    pub fn from_table(table: &str) -> Option<Self> {
        match table {
            "devices" => Some(Self::Device),
            "notifications" => Some(Self::Notification),
            "analysis_jobs" => Some(Self::AnalysisJob),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device => write!(f, "device"),
            Self::Notification => write!(f, "notification"),
            Self::AnalysisJob => write!(f, "analysis_job"),
        }
    }
}

/// Detection status of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionStatus {
    Stopped,
    Started,
}

impl DetectionStatus {
    pub fn inverse(self) -> Self {
        match self {
            Self::Stopped => Self::Started,
            Self::Started => Self::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Started => "started",
        }
    }
}

impl Default for DetectionStatus {
    fn default() -> Self {
        Self::Stopped
    }
}

impl fmt::Display for DetectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectionStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "stopped" => Ok(Self::Stopped),
            "started" => Ok(Self::Started),
            other => Err(crate::Error::Database(format!(
                "unknown detection status: {}",
                other
            ))),
        }
    }
}

/// Analysis job status, ordered along its only legal direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            other => Err(crate::Error::Database(format!("unknown job status: {}", other))),
        }
    }
}

/// Verdict produced by the detector for a completed job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "Yes")]
    ViolenceDetected,
    #[serde(rename = "No")]
    Clear,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ViolenceDetected => "Yes",
            Self::Clear => "No",
        }
    }
}

impl FromStr for Verdict {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "Yes" => Ok(Self::ViolenceDetected),
            "No" => Ok(Self::Clear),
            other => Err(crate::Error::Database(format!("unknown verdict: {}", other))),
        }
    }
}

/// Registered network camera
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    /// Network address the detector pulls frames from
    pub address: String,
    pub status: DetectionStatus,
    pub created_at: DateTime<Utc>,
    /// Revision timestamp maintained by the store
    pub updated_at: DateTime<Utc>,
}

/// Detector-created alert (append-only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub device_id: String,
    pub user_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Asynchronous video analysis job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: String,
    pub user_id: String,
    pub video_uri: String,
    pub status: JobStatus,
    pub result: Option<Verdict>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Any entity row, tagged by type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity_type", content = "row", rename_all = "snake_case")]
pub enum EntityRecord {
    Device(Device),
    Notification(Notification),
    AnalysisJob(AnalysisJob),
}

impl EntityRecord {
    pub fn id(&self) -> &str {
        match self {
            Self::Device(d) => &d.id,
            Self::Notification(n) => &n.id,
            Self::AnalysisJob(j) => &j.id,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Device(_) => EntityType::Device,
            Self::Notification(_) => EntityType::Notification,
            Self::AnalysisJob(_) => EntityType::AnalysisJob,
        }
    }

    /// Natural ordering timestamp (creation time)
    pub fn natural_at(&self) -> DateTime<Utc> {
        match self {
            Self::Device(d) => d.created_at,
            Self::Notification(n) => n.timestamp,
            Self::AnalysisJob(j) => j.created_at,
        }
    }

    /// Timestamp of the last authoritative change embedded in the row
    pub fn revision_at(&self) -> DateTime<Utc> {
        match self {
            Self::Device(d) => d.updated_at,
            Self::Notification(n) => n.timestamp,
            Self::AnalysisJob(j) => j.updated_at,
        }
    }

    /// Owning user id
    pub fn owner_id(&self) -> &str {
        match self {
            Self::Device(d) => &d.owner_id,
            Self::Notification(n) => &n.user_id,
            Self::AnalysisJob(j) => &j.user_id,
        }
    }

    /// Device the row belongs to (devices belong to themselves)
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::Device(d) => Some(&d.id),
            Self::Notification(n) => Some(&n.device_id),
            Self::AnalysisJob(_) => None,
        }
    }

    pub fn as_device(&self) -> Option<&Device> {
        match self {
            Self::Device(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_notification(&self) -> Option<&Notification> {
        match self {
            Self::Notification(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_job(&self) -> Option<&AnalysisJob> {
        match self {
            Self::AnalysisJob(j) => Some(j),
            _ => None,
        }
    }
}

impl From<Device> for EntityRecord {
    fn from(device: Device) -> Self {
        Self::Device(device)
    }
}

impl From<Notification> for EntityRecord {
    fn from(notification: Notification) -> Self {
        Self::Notification(notification)
    }
}

impl From<AnalysisJob> for EntityRecord {
    fn from(job: AnalysisJob) -> Self {
        Self::AnalysisJob(job)
    }
}
