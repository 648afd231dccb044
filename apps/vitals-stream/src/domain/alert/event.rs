//! Alert Events
//!
//! Parses backend threshold-alert payloads into [`AlertEvent`]. The student
//! id and both heart rates are required; the rest falls back to defaults.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::vitals::EntityId;

const UNKNOWN_STUDENT: &str = "Unknown Student";

/// Reasons an alert payload is rejected.
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    /// Payload is not a JSON object.
    #[error("alert payload is not a JSON object")]
    NotAnObject,

    /// Payload fields have the wrong types.
    #[error("malformed alert payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A required field is absent.
    #[error("alert payload is missing {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAlert {
    student_id: Option<String>,
    student_name: Option<String>,
    current_heart_rate: Option<f64>,
    threshold_heart_rate: Option<f64>,
    alert_message: Option<String>,
    timestamp: Option<String>,
}

/// A heart-rate threshold breach reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    /// Student the alert is about.
    pub student_id: EntityId,
    /// Display name.
    pub student_name: String,
    /// Observed heart rate.
    pub current_heart_rate: f64,
    /// Age-adjusted threshold that was exceeded.
    pub threshold_heart_rate: f64,
    /// Human-readable message.
    pub alert_message: String,
    /// Event timestamp as sent, or the receive time in RFC 3339.
    pub timestamp: String,
}

impl AlertEvent {
    /// Create an event with the default name and message.
    #[must_use]
    pub fn new(
        student_id: impl Into<EntityId>,
        current_heart_rate: f64,
        threshold_heart_rate: f64,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            student_id: student_id.into(),
            student_name: UNKNOWN_STUDENT.to_string(),
            current_heart_rate,
            threshold_heart_rate,
            alert_message: default_message(current_heart_rate, threshold_heart_rate),
            timestamp: timestamp.into(),
        }
    }

    /// Decode a broker payload, filling in defaults.
    ///
    /// # Errors
    ///
    /// Returns `AlertError` if the payload is not an object, has mistyped
    /// fields, or lacks the student id or either heart rate.
    pub fn from_payload(payload: &Value, received_at: DateTime<Utc>) -> Result<Self, AlertError> {
        if !payload.is_object() {
            return Err(AlertError::NotAnObject);
        }

        let raw: RawAlert = serde_json::from_value(payload.clone())?;
        let student_id = raw
            .student_id
            .filter(|id| !id.is_empty())
            .ok_or(AlertError::MissingField("studentId"))?;
        let current = raw
            .current_heart_rate
            .ok_or(AlertError::MissingField("currentHeartRate"))?;
        let threshold = raw
            .threshold_heart_rate
            .ok_or(AlertError::MissingField("thresholdHeartRate"))?;

        Ok(Self {
            student_id,
            student_name: raw
                .student_name
                .unwrap_or_else(|| UNKNOWN_STUDENT.to_string()),
            current_heart_rate: current,
            threshold_heart_rate: threshold,
            alert_message: raw
                .alert_message
                .unwrap_or_else(|| default_message(current, threshold)),
            timestamp: raw
                .timestamp
                .unwrap_or_else(|| received_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        })
    }

    /// Log entry id: student id followed by the timestamp.
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}{}", self.student_id, self.timestamp)
    }

    /// Event timestamp parsed as RFC 3339, if possible.
    #[must_use]
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }
}

fn default_message(current: f64, threshold: f64) -> String {
    format!("Heart rate exceeded threshold: {current} > {threshold}")
}
