//! Plate numbers and the records kept for them.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Width of the `plate_number` column.
pub const MAX_PLATE_LEN: usize = 15;

/// Normalize a raw plate reading: uppercase with all whitespace removed.
///
/// Returns `None` when nothing usable is left or the result cannot be stored.
pub fn normalize_plate(raw: &str) -> Option<String> {
    let plate: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect();

    if plate.is_empty() || plate.chars().count() > MAX_PLATE_LEN {
        return None;
    }
    Some(plate)
}

/// Vehicle details returned by the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleAttributes {
    pub make: Option<String>,
    #[serde(rename = "colour")]
    pub color: Option<String>,
    pub fuel_type: Option<String>,
    pub mot_status: Option<String>,
    pub tax_status: Option<String>,
    #[serde(rename = "motExpiryDate")]
    pub mot_expiry: Option<NaiveDate>,
    #[serde(rename = "taxDueDate")]
    pub tax_due: Option<NaiveDate>,
    pub year_of_manufacture: Option<i32>,
    #[serde(rename = "monthOfFirstRegistration")]
    pub first_registration_month: Option<String>,
}

/// One accepted sighting of a plate, ready to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlateObservation {
    /// Normalized plate number
    pub plate: String,
    /// When the detection was received
    pub captured_at: DateTime<Utc>,
    /// Base64 thumbnail sent with the detection
    pub image: Option<String>,
    /// Registry details, when a lookup succeeded
    pub attributes: Option<VehicleAttributes>,
}

/// Stored plate record, one per distinct normalized plate
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlateRecord {
    pub id: i32,
    pub plate_number: String,
    /// First time the plate was seen
    pub capture_time: DateTime<Utc>,
    /// Latest time the plate was seen
    pub recent_capture_time: DateTime<Utc>,
    pub image_url: Option<String>,
    /// Clip file name in the clip directory
    pub video_url: Option<String>,
    /// Event time of the attached clip
    pub video_captured_at: Option<DateTime<Utc>>,
    pub car_make: Option<String>,
    pub car_color: Option<String>,
    pub fuel_type: Option<String>,
    pub mot_status: Option<String>,
    pub tax_status: Option<String>,
    pub mot_expiry_date: Option<NaiveDate>,
    pub tax_due_date: Option<NaiveDate>,
    pub year_of_manufacture: Option<i32>,
    pub month_of_first_registration: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
