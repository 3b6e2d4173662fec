use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use farm_mapper_core::{Coordinate, EntityId, TelemetryRecord};
use serde::{Deserialize, Serialize};

/// Current-location provider for a set of devices.
///
/// The pipeline calls this at most once per invocation and skips the call
/// entirely when no sensor candidates exist. Failures propagate unmodified;
/// there are no retries.
pub trait TelemetrySource {
    /// Fetch the current reading for each requested device.
    ///
    /// # Errors
    /// Returns an error when `device_ids` is empty or the source fails.
    fn fetch_records(&self, device_ids: &[EntityId]) -> Result<Vec<TelemetryRecord>>;
}

#[derive(Debug, Serialize)]
struct FetchRequest<'a> {
    ids: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLocation {
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTelemetryRecord {
    device_id: EntityId,
    location: WireLocation,
}

impl From<WireTelemetryRecord> for TelemetryRecord {
    fn from(wire: WireTelemetryRecord) -> Self {
        Self {
            device_id: wire.device_id,
            location: Coordinate::new(wire.location.latitude, wire.location.longitude),
        }
    }
}

fn joined_ids(device_ids: &[EntityId]) -> Result<String> {
    if device_ids.is_empty() {
        return Err(anyhow!("telemetry fetch requires at least one device id"));
    }

    Ok(device_ids.iter().map(EntityId::as_str).collect::<Vec<_>>().join(","))
}

/// HTTP client for the remote telemetry API.
///
/// The API accepts a POST body of `{"ids": "<comma-joined device ids>"}` and
/// answers with an array of `{deviceId, location: {latitude, longitude}}`.
pub struct HttpTelemetryClient {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpTelemetryClient {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            agent: ureq::AgentBuilder::new().timeout(Duration::from_secs(30)).build(),
        }
    }
}

impl TelemetrySource for HttpTelemetryClient {
    fn fetch_records(&self, device_ids: &[EntityId]) -> Result<Vec<TelemetryRecord>> {
        let ids = joined_ids(device_ids)?;
        let response = self
            .agent
            .post(&self.endpoint)
            .send_json(FetchRequest { ids: &ids })
            .with_context(|| format!("telemetry request to {} failed", self.endpoint))?;

        let records: Vec<WireTelemetryRecord> = response
            .into_json()
            .with_context(|| format!("telemetry response from {} is not valid", self.endpoint))?;

        Ok(records.into_iter().map(TelemetryRecord::from).collect())
    }
}

/// File-backed telemetry source for offline and repeatable runs.
///
/// Reads a JSON array in the remote API's wire format and serves the subset
/// matching the requested device IDs.
pub struct FileTelemetrySource {
    path: PathBuf,
}

impl FileTelemetrySource {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl TelemetrySource for FileTelemetrySource {
    fn fetch_records(&self, device_ids: &[EntityId]) -> Result<Vec<TelemetryRecord>> {
        joined_ids(device_ids)?;

        let body = fs::read_to_string(&self.path).with_context(|| {
            format!("failed to read telemetry records file {}", self.path.display())
        })?;
        let records: Vec<WireTelemetryRecord> = serde_json::from_str(&body).with_context(|| {
            format!("failed to parse telemetry records file {}", self.path.display())
        })?;

        let requested = device_ids.iter().cloned().collect::<BTreeSet<_>>();
        Ok(records
            .into_iter()
            .map(TelemetryRecord::from)
            .filter(|record| requested.contains(&record.device_id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test IDs: TTEL-001
    #[test]
    fn wire_records_decode_camel_case_and_numeric_device_ids() {
        let body = r#"[
            {"deviceId": "d1", "location": {"latitude": 1.5, "longitude": 2.5}},
            {"deviceId": 7, "location": {"latitude": -3.0, "longitude": 4.0}}
        ]"#;

        let records: Vec<WireTelemetryRecord> = match serde_json::from_str(body) {
            Ok(records) => records,
            Err(err) => panic!("wire records should parse: {err}"),
        };
        let records = records.into_iter().map(TelemetryRecord::from).collect::<Vec<_>>();

        assert_eq!(records[0].device_id, EntityId::new("d1"));
        assert!((records[0].location.latitude - 1.5).abs() < f64::EPSILON);
        assert_eq!(records[1].device_id, EntityId::new("7"));
        assert!((records[1].location.longitude - 4.0).abs() < f64::EPSILON);
    }

    // Test IDs: TTEL-002
    #[test]
    fn request_ids_are_comma_joined() {
        let ids = vec![EntityId::new("d1"), EntityId::new("d2"), EntityId::new("d3")];
        let joined = match joined_ids(&ids) {
            Ok(joined) => joined,
            Err(err) => panic!("non-empty ids should join: {err}"),
        };
        assert_eq!(joined, "d1,d2,d3");
    }

    // Test IDs: TTEL-003
    #[test]
    fn empty_id_set_is_rejected_before_any_io() {
        let source = FileTelemetrySource::new(PathBuf::from("/nonexistent/records.json"));
        let err = match source.fetch_records(&[]) {
            Ok(_) => panic!("empty id set should be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("at least one device id"));
    }

    // Test IDs: TTEL-004
    #[test]
    fn file_source_serves_only_requested_devices() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!(
            "farm-mapper-telemetry-test-{}.json",
            std::process::id()
        ));
        let body = r#"[
            {"deviceId": "d1", "location": {"latitude": 1.0, "longitude": 1.0}},
            {"deviceId": "d2", "location": {"latitude": 2.0, "longitude": 2.0}}
        ]"#;
        if let Err(err) = fs::write(&path, body) {
            panic!("fixture file should write: {err}");
        }

        let source = FileTelemetrySource::new(path.clone());
        let records = match source.fetch_records(&[EntityId::new("d2")]) {
            Ok(records) => records,
            Err(err) => panic!("file source should read fixture: {err}"),
        };

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].device_id, EntityId::new("d2"));

        let _ = fs::remove_file(&path);
    }
}
