//! Core domain model for stormtrack: feed-shaped input records and the
//! derived tabular row types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

pub const CRATE_NAME: &str = "stormtrack-core";

/// Serialization format for advisory issuance timestamps, matching the
/// feed's own rendering (`2023-08-22T03:00:00.000Z`).
pub const ISSUANCE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Serialization format for resolved forecast valid times.
pub const VALID_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Top-level shape of the upstream advisory feed.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedDocument {
    #[serde(rename = "activeStorms", default)]
    pub active_storms: Vec<ActiveStorm>,
}

/// One currently tracked tropical system as reported by the feed.
///
/// Projected fields are optional so that a record missing a field still
/// deserializes; extraction then fails per storm, not per feed.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveStorm {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub classification: Option<String>,
    #[serde(default, deserialize_with = "numeric_string")]
    pub intensity: Option<String>,
    #[serde(default, deserialize_with = "numeric_string")]
    pub pressure: Option<String>,
    #[serde(default)]
    pub latitude_numeric: Option<f64>,
    #[serde(default)]
    pub longitude_numeric: Option<f64>,
    #[serde(default)]
    pub last_update: Option<String>,
    #[serde(default)]
    pub forecast_advisory: Option<ForecastAdvisory>,
}

/// Pointer to the storm's latest numbered forecast advisory.
#[derive(Debug, Clone, Deserialize)]
pub struct ForecastAdvisory {
    pub issuance: String,
    pub url: String,
}

/// The feed renders intensity and pressure as strings, but some mirrors
/// emit bare numbers; both land here as the string form.
fn numeric_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(i64),
        Str(String),
    }

    Ok(Option::<NumOrStr>::deserialize(deserializer)?.map(|v| match v {
        NumOrStr::Num(n) => n.to_string(),
        NumOrStr::Str(s) => s,
    }))
}

/// Basin code is the first two characters of the storm id
/// (`al062023` -> `al`).
pub fn basin_of(id: &str) -> String {
    id.chars().take(2).collect()
}

/// Current position and intensity of one storm at fetch time.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedTrackRow {
    pub id: String,
    pub name: String,
    pub basin: String,
    pub intensity: i32,
    pub pressure: i32,
    pub latitude: f64,
    pub longitude: f64,
    /// Feed timestamp, passed through verbatim; never interpreted.
    pub last_update: String,
}

impl ObservedTrackRow {
    pub const HEADER: [&'static str; 8] = [
        "id",
        "name",
        "basin",
        "intensity",
        "pressure",
        "latitude",
        "longitude",
        "lastUpdate",
    ];

    /// Stable tabular projection; field order matches [`Self::HEADER`].
    pub fn to_record(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.basin.clone(),
            self.intensity.to_string(),
            self.pressure.to_string(),
            self.latitude.to_string(),
            self.longitude.to_string(),
            self.last_update.clone(),
        ]
    }
}

/// One forecast track point parsed out of an advisory bulletin.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastTrackRow {
    pub id: String,
    pub name: String,
    pub issuance: DateTime<Utc>,
    pub basin: String,
    pub latitude: f64,
    pub longitude: f64,
    pub max_wind: i32,
    pub valid_time: DateTime<Utc>,
}

impl ForecastTrackRow {
    pub const HEADER: [&'static str; 8] = [
        "id",
        "name",
        "issuance",
        "basin",
        "latitude",
        "longitude",
        "maxwind",
        "validTime",
    ];

    /// Stable tabular projection; field order matches [`Self::HEADER`].
    pub fn to_record(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.issuance.format(ISSUANCE_FORMAT).to_string(),
            self.basin.clone(),
            self.latitude.to_string(),
            self.longitude.to_string(),
            self.max_wind.to_string(),
            self.valid_time.format(VALID_TIME_FORMAT).to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn basin_is_first_two_id_chars() {
        assert_eq!(basin_of("al062023"), "al");
        assert_eq!(basin_of("ep"), "ep");
        assert_eq!(basin_of("x"), "x");
    }

    #[test]
    fn feed_sample_deserializes() {
        let feed: FeedDocument = serde_json::from_str(
            r#"{
                "activeStorms": [
                    {
                        "id": "al062023",
                        "binNumber": "AT1",
                        "name": "Gert",
                        "classification": "TD",
                        "intensity": "25",
                        "pressure": 1008,
                        "latitude": "17.1N",
                        "longitude": "58.4W",
                        "latitudeNumeric": 17.1,
                        "longitudeNumeric": -58.4,
                        "lastUpdate": "2023-08-22T03:00:00.000Z",
                        "forecastAdvisory": {
                            "advNum": "011",
                            "issuance": "2023-08-22T03:00:00.000Z",
                            "url": "https://www.nhc.noaa.gov/text/MIATCMAT1.shtml"
                        }
                    }
                ]
            }"#,
        )
        .expect("feed sample");

        let storm = &feed.active_storms[0];
        assert_eq!(storm.intensity.as_deref(), Some("25"));
        assert_eq!(storm.pressure.as_deref(), Some("1008"));
        assert_eq!(storm.latitude_numeric, Some(17.1));
        assert_eq!(
            storm.forecast_advisory.as_ref().map(|a| a.issuance.as_str()),
            Some("2023-08-22T03:00:00.000Z")
        );
    }

    #[test]
    fn missing_active_storms_key_is_an_empty_feed() {
        let feed: FeedDocument = serde_json::from_str("{}").expect("empty feed");
        assert!(feed.active_storms.is_empty());
    }

    #[test]
    fn forecast_record_field_order_matches_header() {
        let row = ForecastTrackRow {
            id: "al062023".into(),
            name: "Gert".into(),
            issuance: Utc.with_ymd_and_hms(2023, 8, 22, 3, 0, 0).single().unwrap(),
            basin: "al".into(),
            latitude: 22.9,
            longitude: -68.1,
            max_wind: 85,
            valid_time: Utc.with_ymd_and_hms(2023, 8, 30, 0, 0, 0).single().unwrap(),
        };
        let record = row.to_record();
        assert_eq!(record.len(), ForecastTrackRow::HEADER.len());
        assert_eq!(record[2], "2023-08-22T03:00:00.000Z");
        assert_eq!(record[5], "-68.1");
        assert_eq!(record[7], "2023-08-30T00:00:00Z");
    }

    #[test]
    fn observed_record_field_order_matches_header() {
        let row = ObservedTrackRow {
            id: "ep052024".into(),
            name: "Carlotta".into(),
            basin: "ep".into(),
            intensity: 45,
            pressure: 1000,
            latitude: 15.2,
            longitude: -110.5,
            last_update: "2024-08-01T09:00:00.000Z".into(),
        };
        let record = row.to_record();
        assert_eq!(record.len(), ObservedTrackRow::HEADER.len());
        assert_eq!(record[3], "45");
        assert_eq!(record[6], "-110.5");
        assert_eq!(record[7], "2024-08-01T09:00:00.000Z");
    }
}
