//! Vitals Samples
//!
//! One immutable observation for one student, decoded from the broker's
//! camelCase JSON payload:
//!
//! ```json
//! {"studentId":"s-1","classroomId":"42","taskId":"t-9",
//!  "heartRate":88,"oxygenSaturation":98,"timestamp":"2025-03-01T10:00:00",
//!  "isPreActivity":false,"isPostActivity":true}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a tracked student.
pub type EntityId = String;

/// Reasons a sample is rejected.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    /// Payload is not a JSON object.
    #[error("vitals payload is not a JSON object")]
    NotAnObject,

    /// Payload fields have the wrong types.
    #[error("malformed vitals payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// No student id present.
    #[error("vitals sample has no student id")]
    MissingEntityId,

    /// Neither heart rate nor oxygen saturation present.
    #[error("vitals sample for {0} carries no readings")]
    NoReadings(EntityId),

    /// A reading is not a finite, non-negative number.
    #[error("vitals sample has invalid {field}: {value}")]
    InvalidReading {
        /// Offending field.
        field: &'static str,
        /// Offending value.
        value: f64,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVitals {
    physical_id: Option<String>,
    student_id: Option<String>,
    classroom_id: Option<String>,
    task_id: Option<String>,
    heart_rate: Option<f64>,
    oxygen_saturation: Option<f64>,
    timestamp: Option<String>,
    #[serde(default)]
    is_pre_activity: bool,
    #[serde(default)]
    is_post_activity: bool,
}

/// A validated vitals observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VitalsSample {
    /// Student the sample belongs to.
    #[serde(rename = "studentId")]
    pub entity_id: EntityId,
    /// Device-side record id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_id: Option<String>,
    /// Classroom correlation id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classroom_id: Option<String>,
    /// Task correlation id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Beats per minute.
    pub heart_rate: Option<f64>,
    /// Oxygen saturation percentage (0-100).
    pub oxygen_saturation: Option<f64>,
    /// Source timestamp as sent by the device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Taken before the activity.
    pub is_pre_activity: bool,
    /// Taken after the activity.
    pub is_post_activity: bool,
}

impl VitalsSample {
    /// Create a sample with readings only.
    #[must_use]
    pub fn new(
        entity_id: impl Into<EntityId>,
        heart_rate: Option<f64>,
        oxygen_saturation: Option<f64>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            physical_id: None,
            classroom_id: None,
            task_id: None,
            heart_rate,
            oxygen_saturation,
            timestamp: None,
            is_pre_activity: false,
            is_post_activity: false,
        }
    }

    /// Set the classroom correlation id.
    #[must_use]
    pub fn with_classroom(mut self, classroom_id: impl Into<String>) -> Self {
        self.classroom_id = Some(classroom_id.into());
        self
    }

    /// Decode and validate a broker payload.
    ///
    /// # Errors
    ///
    /// Returns `SampleError` if the payload is not an object, has mistyped
    /// fields, or fails [`VitalsSample::validate`].
    pub fn from_payload(payload: &Value) -> Result<Self, SampleError> {
        if !payload.is_object() {
            return Err(SampleError::NotAnObject);
        }

        let raw: RawVitals = serde_json::from_value(payload.clone())?;
        let entity_id = raw
            .student_id
            .filter(|id| !id.trim().is_empty())
            .ok_or(SampleError::MissingEntityId)?;

        let sample = Self {
            entity_id,
            physical_id: raw.physical_id,
            classroom_id: raw.classroom_id,
            task_id: raw.task_id,
            heart_rate: raw.heart_rate,
            oxygen_saturation: raw.oxygen_saturation,
            timestamp: raw.timestamp,
            is_pre_activity: raw.is_pre_activity,
            is_post_activity: raw.is_post_activity,
        };
        sample.validate()?;
        Ok(sample)
    }

    /// Check the required fields.
    ///
    /// # Errors
    ///
    /// Returns `SampleError` when the entity id is blank, no reading is
    /// present, or a reading is not a finite non-negative number.
    pub fn validate(&self) -> Result<(), SampleError> {
        if self.entity_id.trim().is_empty() {
            return Err(SampleError::MissingEntityId);
        }
        if self.heart_rate.is_none() && self.oxygen_saturation.is_none() {
            return Err(SampleError::NoReadings(self.entity_id.clone()));
        }
        check_reading("heartRate", self.heart_rate)?;
        check_reading("oxygenSaturation", self.oxygen_saturation)?;
        Ok(())
    }
}

fn check_reading(field: &'static str, value: Option<f64>) -> Result<(), SampleError> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => Err(SampleError::InvalidReading { field, value: v }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_full_payload() {
        let payload = json!({
            "physicalId": "VITAL-1",
            "studentId": "s-1",
            "classroomId": "42",
            "taskId": "t-9",
            "heartRate": 88,
            "oxygenSaturation": 98.5,
            "timestamp": "2025-03-01T10:00:00",
            "isPreActivity": true
        });

        let sample = VitalsSample::from_payload(&payload).unwrap();
        assert_eq!(sample.entity_id, "s-1");
        assert_eq!(sample.classroom_id.as_deref(), Some("42"));
        assert_eq!(sample.heart_rate, Some(88.0));
        assert_eq!(sample.oxygen_saturation, Some(98.5));
        assert!(sample.is_pre_activity);
        assert!(!sample.is_post_activity);
    }

    #[test]
    fn one_reading_is_enough() {
        let payload = json!({"studentId": "s-1", "oxygenSaturation": 97});
        let sample = VitalsSample::from_payload(&payload).unwrap();
        assert_eq!(sample.heart_rate, None);
    }

    #[test]
    fn rejects_missing_student() {
        let payload = json!({"heartRate": 80});
        assert!(matches!(
            VitalsSample::from_payload(&payload),
            Err(SampleError::MissingEntityId)
        ));

        let blank = json!({"studentId": "  ", "heartRate": 80});
        assert!(matches!(
            VitalsSample::from_payload(&blank),
            Err(SampleError::MissingEntityId)
        ));
    }

    #[test]
    fn rejects_sample_without_readings() {
        let payload = json!({"studentId": "s-1", "taskId": "t"});
        assert!(matches!(
            VitalsSample::from_payload(&payload),
            Err(SampleError::NoReadings(id)) if id == "s-1"
        ));
    }

    #[test]
    fn rejects_mistyped_fields() {
        let payload = json!({"studentId": "s-1", "heartRate": "fast"});
        assert!(matches!(
            VitalsSample::from_payload(&payload),
            Err(SampleError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_non_objects() {
        assert!(matches!(
            VitalsSample::from_payload(&json!([1, 2])),
            Err(SampleError::NotAnObject)
        ));
    }

    #[test]
    fn rejects_negative_reading() {
        let sample = VitalsSample::new("s-1", Some(-4.0), None);
        assert!(matches!(
            sample.validate(),
            Err(SampleError::InvalidReading {
                field: "heartRate",
                ..
            })
        ));
    }

    #[test]
    fn serializes_with_student_id() {
        let sample = VitalsSample::new("s-1", Some(72.0), None).with_classroom("42");
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["studentId"], "s-1");
        assert_eq!(json["classroomId"], "42");
        assert!(json.get("taskId").is_none());
    }
}
