//! Advisory parsing: coordinate tokens, valid-time tokens, the forecast
//! bulletin state machine, and the observed-track projection.

use chrono::{DateTime, Datelike, Timelike, Utc};
use scraper::{Html, Selector};
use stormtrack_core::{basin_of, ActiveStorm, ForecastTrackRow, ObservedTrackRow};
use thiserror::Error;

pub const CRATE_NAME: &str = "stormtrack-advisory";

const FORECAST_MARKER: &str = "FORECAST VALID";
const REMNANTS_MARKER: &str = "REMNANTS OF CENTER LOCATED NEAR";
const MAX_WIND_MARKER: &str = "MAX WIND";

/// Data-shape failures while extracting rows from one storm's feed record
/// or bulletin. All variants are scoped to a single storm.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("coordinate token {0:?} has no usable numeric prefix or hemisphere suffix")]
    MalformedCoordinate(String),
    #[error("time token {0:?} does not split into a 2-digit day and a 4-digit time")]
    MalformedTimeToken(String),
    #[error("storm record is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` has non-numeric value {value:?}")]
    MalformedNumber { field: &'static str, value: String },
}

/// Converts a hemisphere-suffixed token (`"22.9N"`, `"68.1W"`) into signed
/// decimal degrees. North and east are positive, south and west negative.
pub fn parse_coordinate(token: &str) -> Result<f64, ExtractError> {
    let malformed = || ExtractError::MalformedCoordinate(token.to_string());
    let mut chars = token.trim().chars();
    let hemisphere = chars.next_back().ok_or_else(malformed)?;
    let magnitude: f64 = chars.as_str().parse().map_err(|_| malformed())?;
    match hemisphere.to_ascii_uppercase() {
        'N' | 'E' => Ok(magnitude),
        'S' | 'W' => Ok(-magnitude),
        _ => Err(malformed()),
    }
}

/// Rebuilds an absolute timestamp from a bulletin `DD/HHMM[Z]` token and
/// the advisory issuance time: year and month come from the issuance, day,
/// hour and minute from the token, seconds are zeroed.
///
/// Bulletins never state a month or year, so a forecast day smaller than
/// the issuance day (a bulletin spanning a month boundary) stays in the
/// issuance month. Known limitation, kept to match upstream data handling.
pub fn resolve_valid_time(
    token: &str,
    issuance: DateTime<Utc>,
) -> Result<DateTime<Utc>, ExtractError> {
    let malformed = || ExtractError::MalformedTimeToken(token.to_string());
    let (day_part, time_part) = token.split_once('/').ok_or_else(malformed)?;
    let day: u32 = day_part.trim().parse().map_err(|_| malformed())?;
    let digits: Vec<char> = time_part.chars().take(4).collect();
    if digits.len() < 4 || !digits.iter().all(|c| c.is_ascii_digit()) {
        return Err(malformed());
    }
    let hour: u32 = digits[..2].iter().collect::<String>().parse().map_err(|_| malformed())?;
    let minute: u32 = digits[2..4].iter().collect::<String>().parse().map_err(|_| malformed())?;
    issuance
        .with_day(day)
        .and_then(|t| t.with_hour(hour))
        .and_then(|t| t.with_minute(minute))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .ok_or_else(malformed)
}

/// Parses the feed's ISO-8601 issuance string
/// (`2023-08-22T03:00:00.000Z`) into UTC.
pub fn parse_issuance(raw: &str) -> Result<DateTime<Utc>, ExtractError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ExtractError::MalformedTimeToken(raw.to_string()))
}

/// Identity of the storm a bulletin belongs to, stamped onto each row.
#[derive(Debug, Clone)]
pub struct StormKey {
    pub id: String,
    pub name: String,
    pub issuance: DateTime<Utc>,
}

/// Pending slots accumulated while scanning bulletin lines.
///
/// A position marker fills the valid time and the raw coordinate tokens; a
/// max-wind marker fills the wind. Once coordinates and wind are all
/// present, a row is emitted and every slot clears, so each forecast point
/// pairs with the most recently seen max-wind value.
#[derive(Debug, Default)]
pub struct BulletinState {
    valid_time: Option<DateTime<Utc>>,
    latitude: Option<String>,
    longitude: Option<String>,
    max_wind: Option<String>,
}

impl BulletinState {
    /// Advances the machine by one bulletin line, emitting a completed
    /// forecast point if this line filled the last open slot.
    pub fn step(
        &mut self,
        line: &str,
        key: &StormKey,
    ) -> Result<Option<ForecastTrackRow>, ExtractError> {
        let cleaned = line.replace("...", " ");
        let tokens: Vec<&str> = cleaned.split_whitespace().collect();

        if cleaned.starts_with(FORECAST_MARKER) && tokens.len() >= 5 {
            self.valid_time = Some(resolve_valid_time(tokens[2], key.issuance)?);
            self.latitude = Some(tokens[3].to_string());
            self.longitude = Some(tokens[4].to_string());
        } else if cleaned.starts_with(REMNANTS_MARKER) && tokens.len() >= 8 {
            // The time token sits one past the guard; a line cut off right
            // at the guard is malformed, not silently skipped.
            let time_token = tokens
                .get(8)
                .copied()
                .ok_or_else(|| ExtractError::MalformedTimeToken(cleaned.trim().to_string()))?;
            self.valid_time = Some(resolve_valid_time(time_token, key.issuance)?);
            self.latitude = Some(tokens[5].to_string());
            self.longitude = Some(tokens[6].to_string());
        }

        if cleaned.starts_with(MAX_WIND_MARKER) && tokens.len() >= 5 {
            self.max_wind = Some(tokens[2].to_string());
        }

        self.try_emit(key)
    }

    // Latitude and longitude are only ever set together with the valid
    // time, so requiring all four slots is the same condition as the
    // three-coordinate one while keeping `valid_time` non-optional in the
    // emitted row.
    fn try_emit(&mut self, key: &StormKey) -> Result<Option<ForecastTrackRow>, ExtractError> {
        let (Some(lat), Some(lon), Some(wind), Some(valid_time)) = (
            self.latitude.as_deref(),
            self.longitude.as_deref(),
            self.max_wind.as_deref(),
            self.valid_time,
        ) else {
            return Ok(None);
        };

        let row = ForecastTrackRow {
            id: key.id.clone(),
            name: key.name.clone(),
            issuance: key.issuance,
            basin: basin_of(&key.id),
            latitude: parse_coordinate(lat)?,
            longitude: parse_coordinate(lon)?,
            max_wind: wind.parse().map_err(|_| ExtractError::MalformedNumber {
                field: "maxwind",
                value: wind.to_string(),
            })?,
            valid_time,
        };

        *self = Self::default();
        Ok(Some(row))
    }
}

/// Runs the state machine over a full bulletin body, returning every
/// forecast point in line order.
///
/// An empty or unrecognized body yields an empty vec (the bulletin simply
/// published no forecast points); a malformed token aborts the bulletin
/// with the underlying error.
pub fn parse_bulletin(
    body: &str,
    key: &StormKey,
) -> Result<Vec<ForecastTrackRow>, ExtractError> {
    let mut state = BulletinState::default();
    let mut rows = Vec::new();
    for line in body.lines() {
        if let Some(row) = state.step(line, key)? {
            rows.push(row);
        }
    }
    Ok(rows)
}

/// Extracts the plain-text bulletin body from a fetched document: the text
/// of the first `<pre>` element, or the document itself when no `<pre>` is
/// present (some advisory mirrors serve bare text).
pub fn bulletin_text(document: &str) -> String {
    let html = Html::parse_document(document);
    if let Ok(pre) = Selector::parse("pre") {
        if let Some(node) = html.select(&pre).next() {
            return node.text().collect();
        }
    }
    document.to_string()
}

/// Projects one active-storm record into its observed-track row.
pub fn extract_observed(storm: &ActiveStorm) -> Result<ObservedTrackRow, ExtractError> {
    Ok(ObservedTrackRow {
        id: storm.id.clone(),
        name: storm.name.clone(),
        basin: basin_of(&storm.id),
        intensity: required_int("intensity", storm.intensity.as_deref())?,
        pressure: required_int("pressure", storm.pressure.as_deref())?,
        latitude: storm
            .latitude_numeric
            .ok_or(ExtractError::MissingField("latitudeNumeric"))?,
        longitude: storm
            .longitude_numeric
            .ok_or(ExtractError::MissingField("longitudeNumeric"))?,
        last_update: storm
            .last_update
            .clone()
            .ok_or(ExtractError::MissingField("lastUpdate"))?,
    })
}

fn required_int(field: &'static str, value: Option<&str>) -> Result<i32, ExtractError> {
    let raw = value.ok_or(ExtractError::MissingField(field))?;
    raw.trim().parse().map_err(|_| ExtractError::MalformedNumber {
        field,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use stormtrack_core::{FeedDocument, VALID_TIME_FORMAT};

    fn issuance() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 8, 22, 3, 0, 0).single().unwrap()
    }

    fn key() -> StormKey {
        StormKey {
            id: "al062023".into(),
            name: "Franklin".into(),
            issuance: issuance(),
        }
    }

    #[test]
    fn coordinates_parse_with_hemisphere_sign() {
        assert_eq!(parse_coordinate("22.9N").unwrap(), 22.9);
        assert_eq!(parse_coordinate("68.1W").unwrap(), -68.1);
        assert_eq!(parse_coordinate("140.0E").unwrap(), 140.0);
        assert_eq!(parse_coordinate("5.5S").unwrap(), -5.5);
    }

    #[test]
    fn bad_coordinate_tokens_are_malformed() {
        assert!(matches!(
            parse_coordinate("22.9X"),
            Err(ExtractError::MalformedCoordinate(_))
        ));
        assert!(matches!(
            parse_coordinate("NORTH"),
            Err(ExtractError::MalformedCoordinate(_))
        ));
        assert!(matches!(
            parse_coordinate(""),
            Err(ExtractError::MalformedCoordinate(_))
        ));
    }

    #[test]
    fn valid_time_overwrites_day_hour_minute() {
        let resolved = resolve_valid_time("30/0000Z", issuance()).unwrap();
        assert_eq!(
            resolved.format(VALID_TIME_FORMAT).to_string(),
            "2023-08-30T00:00:00Z"
        );

        let resolved = resolve_valid_time("23/1830Z", issuance()).unwrap();
        assert_eq!(
            resolved.format(VALID_TIME_FORMAT).to_string(),
            "2023-08-23T18:30:00Z"
        );
    }

    // Pins the documented limitation: a forecast day below the issuance
    // day stays in the issuance month instead of rolling forward.
    #[test]
    fn valid_time_does_not_roll_the_month() {
        let resolved = resolve_valid_time("05/1200Z", issuance()).unwrap();
        assert_eq!(
            resolved.format(VALID_TIME_FORMAT).to_string(),
            "2023-08-05T12:00:00Z"
        );
    }

    #[test]
    fn bad_time_tokens_are_malformed() {
        assert!(matches!(
            resolve_valid_time("300000Z", issuance()),
            Err(ExtractError::MalformedTimeToken(_))
        ));
        assert!(matches!(
            resolve_valid_time("30/00", issuance()),
            Err(ExtractError::MalformedTimeToken(_))
        ));
        assert!(matches!(
            resolve_valid_time("xx/0000Z", issuance()),
            Err(ExtractError::MalformedTimeToken(_))
        ));
        // Day 31 does not exist in a 30-day month.
        let sep = Utc.with_ymd_and_hms(2023, 9, 10, 3, 0, 0).single().unwrap();
        assert!(matches!(
            resolve_valid_time("31/0000Z", sep),
            Err(ExtractError::MalformedTimeToken(_))
        ));
    }

    #[test]
    fn two_line_block_emits_one_row() {
        let body = "FORECAST VALID 30/0000Z 22.9N  68.1W\nMAX WIND  85 KT...GUSTS 105 KT.\n";
        let rows = parse_bulletin(body, &key()).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.latitude, 22.9);
        assert_eq!(row.longitude, -68.1);
        assert_eq!(row.max_wind, 85);
        assert_eq!(row.basin, "al");
        assert_eq!(
            row.valid_time.format(VALID_TIME_FORMAT).to_string(),
            "2023-08-30T00:00:00Z"
        );
    }

    #[test]
    fn empty_body_is_not_an_error() {
        assert!(parse_bulletin("", &key()).unwrap().is_empty());
        assert!(parse_bulletin("NO FORECAST POINTS HERE\n", &key()).unwrap().is_empty());
    }

    #[test]
    fn wind_seen_before_position_pairs_with_it() {
        // The current-conditions wind precedes the first forecast block in
        // real bulletins; the position line completes the point.
        let body = "MAX WIND  40 KT...GUSTS  50 KT.\nFORECAST VALID 22/1200Z 17.6N  72.1W\n";
        let rows = parse_bulletin(body, &key()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].max_wind, 40);
        assert_eq!(rows[0].latitude, 17.6);
    }

    #[test]
    fn slots_reset_between_forecast_points() {
        let body = "\
FORECAST VALID 22/1200Z 17.6N  72.1W
MAX WIND  40 KT...GUSTS  50 KT.
34 KT... 40NE  90SE  90SW   0NW.
FORECAST VALID 23/0000Z 18.4N  72.4W...INLAND
MAX WIND  35 KT...GUSTS  45 KT.
";
        let rows = parse_bulletin(body, &key()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].max_wind, 40);
        assert_eq!(rows[1].max_wind, 35);
        assert_eq!(rows[1].longitude, -72.4);
    }

    #[test]
    fn remnants_phrasing_is_recognized() {
        let body = "\
MAX WIND  25 KT...GUSTS  35 KT.
REMNANTS OF CENTER LOCATED NEAR 22.9N  68.1W AT 30/0000Z
";
        let rows = parse_bulletin(body, &key()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].latitude, 22.9);
        assert_eq!(rows[0].longitude, -68.1);
        assert_eq!(rows[0].max_wind, 25);
        assert_eq!(
            rows[0].valid_time.format(VALID_TIME_FORMAT).to_string(),
            "2023-08-30T00:00:00Z"
        );
    }

    #[test]
    fn short_forecast_valid_line_is_ignored() {
        // Dissipation lines drop the coordinates; too few tokens, no slot
        // updates, nothing emitted.
        let body = "FORECAST VALID 26/0000Z...DISSIPATED\nMAX WIND  20 KT...GUSTS  30 KT.\n";
        assert!(parse_bulletin(body, &key()).unwrap().is_empty());
    }

    #[test]
    fn malformed_wind_aborts_the_bulletin() {
        let body = "FORECAST VALID 30/0000Z 22.9N  68.1W\nMAX WIND  XX KT...GUSTS 105 KT.\n";
        assert!(matches!(
            parse_bulletin(body, &key()),
            Err(ExtractError::MalformedNumber { field: "maxwind", .. })
        ));
    }

    #[test]
    fn bulletin_text_prefers_the_first_pre_block() {
        let html = "<html><body><div>nav</div><pre>FORECAST VALID 30/0000Z 22.9N  68.1W\n</pre><pre>other</pre></body></html>";
        assert_eq!(
            bulletin_text(html),
            "FORECAST VALID 30/0000Z 22.9N  68.1W\n"
        );
    }

    #[test]
    fn bulletin_text_falls_back_to_the_raw_body() {
        let text = "FORECAST VALID 30/0000Z 22.9N  68.1W\n";
        assert_eq!(bulletin_text(text), text);
    }

    #[test]
    fn missing_field_fails_only_that_storm() {
        let feed: FeedDocument = serde_json::from_str(
            r#"{
                "activeStorms": [
                    {
                        "id": "al062023",
                        "name": "Gert",
                        "pressure": "1008",
                        "latitudeNumeric": 17.1,
                        "longitudeNumeric": -58.4,
                        "lastUpdate": "2023-08-22T03:00:00.000Z"
                    },
                    {
                        "id": "al082023",
                        "name": "Franklin",
                        "intensity": "40",
                        "pressure": "1003",
                        "latitudeNumeric": 17.1,
                        "longitudeNumeric": -71.9,
                        "lastUpdate": "2023-08-22T03:00:00.000Z"
                    }
                ]
            }"#,
        )
        .unwrap();

        let results: Vec<_> = feed.active_storms.iter().map(extract_observed).collect();
        assert!(matches!(
            results[0],
            Err(ExtractError::MissingField("intensity"))
        ));
        let ok = results[1].as_ref().unwrap();
        assert_eq!(ok.basin, "al");
        assert_eq!(ok.intensity, 40);
        assert_eq!(ok.pressure, 1003);
    }

    #[test]
    fn non_numeric_intensity_is_malformed_not_missing() {
        assert!(matches!(
            required_int("intensity", Some("TD")),
            Err(ExtractError::MalformedNumber { field: "intensity", .. })
        ));
    }
}
