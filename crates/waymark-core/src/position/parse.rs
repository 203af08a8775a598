// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Location line parser.
//!
//! Accepts the two line formats commonly emitted by GPS-over-TCP bridges:
//!
//! ```text
//! $GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47
//! $GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A
//! 25.0330,121.5654,8.5,1.2,1700000000000
//! ```
//!
//! The CSV form is `lat,lng[,accuracy_m[,speed_mps[,unix_millis]]]`.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use thiserror::Error;

use super::Fix;

/// Rough conversion from horizontal dilution of precision to meters.
const HDOP_TO_METERS: f64 = 5.0;
const KNOTS_TO_MPS: f64 = 0.514_444;

/// Errors produced while parsing a location line.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LineError {
    #[error("invalid line format: {0}")]
    InvalidFormat(String),

    #[error("checksum mismatch: expected {expected:02X}, got {actual:02X}")]
    Checksum { expected: u8, actual: u8 },

    #[error("invalid value for field '{field}': {value}")]
    InvalidValue { field: &'static str, value: String },

    /// The receiver reported that it has no position fix.
    #[error("receiver has no fix")]
    NoFix,
}

/// Parse one line into a fix.
///
/// Returns `Ok(None)` for blank lines, comments and sentences that carry no
/// position (e.g. `$GPGSV`).
pub fn parse_line(line: &str, received_at: DateTime<Utc>) -> Result<Option<Fix>, LineError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    if let Some(sentence) = line.strip_prefix('$') {
        parse_nmea(sentence, received_at)
    } else {
        parse_csv(line, received_at).map(Some)
    }
}

fn parse_nmea(sentence: &str, received_at: DateTime<Utc>) -> Result<Option<Fix>, LineError> {
    let body = verify_checksum(sentence)?;
    let parts: Vec<&str> = body.split(',').collect();

    let address = parts[0];
    if address.len() < 5 || !address.is_ascii() {
        return Err(LineError::InvalidFormat(format!("bad sentence address '{address}'")));
    }

    match &address[address.len() - 3..] {
        "GGA" => parse_gga(&parts, received_at),
        "RMC" => parse_rmc(&parts, received_at),
        _ => Ok(None),
    }
}

/// Strip and validate the optional `*hh` checksum suffix.
fn verify_checksum(sentence: &str) -> Result<&str, LineError> {
    let Some((body, checksum)) = sentence.split_once('*') else {
        return Ok(sentence);
    };
    let expected = u8::from_str_radix(checksum.trim(), 16).map_err(|_| LineError::InvalidValue {
        field: "checksum",
        value: checksum.to_string(),
    })?;
    let actual = body.bytes().fold(0u8, |acc, b| acc ^ b);
    if actual != expected {
        return Err(LineError::Checksum { expected, actual });
    }
    Ok(body)
}

fn parse_gga(parts: &[&str], received_at: DateTime<Utc>) -> Result<Option<Fix>, LineError> {
    if parts.len() < 9 {
        return Err(LineError::InvalidFormat("GGA sentence too short".to_string()));
    }
    if parts[6].is_empty() || parts[6] == "0" {
        return Err(LineError::NoFix);
    }

    let lat = parse_coordinate(parts[2], parts[3], "latitude")?;
    let lng = parse_coordinate(parts[4], parts[5], "longitude")?;
    let accuracy = parts[8].parse::<f64>().ok().map(|hdop| hdop * HDOP_TO_METERS);
    let timestamp = parse_time(parts[1])
        .map_or(received_at, |time| received_at.date_naive().and_time(time).and_utc());

    Ok(Some(Fix {
        lat,
        lng,
        accuracy,
        speed: None,
        timestamp,
    }))
}

fn parse_rmc(parts: &[&str], received_at: DateTime<Utc>) -> Result<Option<Fix>, LineError> {
    if parts.len() < 10 {
        return Err(LineError::InvalidFormat("RMC sentence too short".to_string()));
    }
    if parts[2] != "A" {
        return Err(LineError::NoFix);
    }

    let lat = parse_coordinate(parts[3], parts[4], "latitude")?;
    let lng = parse_coordinate(parts[5], parts[6], "longitude")?;
    let speed = parts[7].parse::<f64>().ok().map(|knots| knots * KNOTS_TO_MPS);
    let timestamp = match (parse_time(parts[1]), parse_date(parts[9])) {
        (Some(time), Some(date)) => date.and_time(time).and_utc(),
        _ => received_at,
    };

    Ok(Some(Fix {
        lat,
        lng,
        accuracy: None,
        speed,
        timestamp,
    }))
}

/// Convert NMEA `(d)ddmm.mmmm` plus hemisphere into signed decimal degrees.
fn parse_coordinate(value: &str, hemisphere: &str, field: &'static str) -> Result<f64, LineError> {
    let invalid = || LineError::InvalidValue {
        field,
        value: format!("{value},{hemisphere}"),
    };

    if !value.is_ascii() {
        return Err(invalid());
    }
    let dot = value.find('.').unwrap_or(value.len());
    if dot < 3 {
        return Err(invalid());
    }
    let degrees: f64 = value[..dot - 2].parse().map_err(|_| invalid())?;
    let minutes: f64 = value[dot - 2..].parse().map_err(|_| invalid())?;
    let decimal = degrees + minutes / 60.0;

    match hemisphere {
        "N" | "E" => Ok(decimal),
        "S" | "W" => Ok(-decimal),
        _ => Err(invalid()),
    }
}

fn parse_time(value: &str) -> Option<NaiveTime> {
    let whole = value.split('.').next()?;
    NaiveTime::parse_from_str(whole, "%H%M%S").ok()
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%d%m%y").ok()
}

fn parse_csv(line: &str, received_at: DateTime<Utc>) -> Result<Fix, LineError> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 2 {
        return Err(LineError::InvalidFormat(format!("expected 'lat,lng', got '{line}'")));
    }

    let lat = parse_number(parts[0], "latitude")?;
    let lng = parse_number(parts[1], "longitude")?;
    if !(-90.0..=90.0).contains(&lat) {
        return Err(LineError::InvalidValue {
            field: "latitude",
            value: parts[0].to_string(),
        });
    }
    if !(-180.0..=180.0).contains(&lng) {
        return Err(LineError::InvalidValue {
            field: "longitude",
            value: parts[1].to_string(),
        });
    }

    let optional = |idx: usize, field: &'static str| -> Result<Option<f64>, LineError> {
        match parts.get(idx) {
            Some(v) if !v.is_empty() => parse_number(v, field).map(Some),
            _ => Ok(None),
        }
    };
    let accuracy = optional(2, "accuracy")?;
    let speed = optional(3, "speed")?;
    let timestamp = match parts.get(4).filter(|v| !v.is_empty()) {
        Some(v) => {
            let millis = v.parse::<i64>().map_err(|_| LineError::InvalidValue {
                field: "timestamp",
                value: (*v).to_string(),
            })?;
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| LineError::InvalidValue {
                    field: "timestamp",
                    value: (*v).to_string(),
                })?
        }
        None => received_at,
    };

    Ok(Fix {
        lat,
        lng,
        accuracy,
        speed,
        timestamp,
    })
}

fn parse_number(value: &str, field: &'static str) -> Result<f64, LineError> {
    value.parse::<f64>().map_err(|_| LineError::InvalidValue {
        field,
        value: value.to_string(),
    })
}
