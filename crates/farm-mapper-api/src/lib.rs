use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use farm_mapper_core::{
    map_devices_to_farms, resolve_farm, sensor_candidates, EntityId, MappedFarm, TaxonomyKind,
};
use farm_mapper_store_sqlite::{SchemaStatus, SqliteStore, StoredMapping};
use farm_mapper_telemetry::TelemetrySource;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MappingRunId(pub Ulid);

impl MappingRunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for MappingRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for MappingRunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of one mapping run: what was computed, how much of the input
/// contributed, and a fingerprint of the persisted snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappingRunSummary {
    pub run_id: MappingRunId,
    pub user_id: String,
    pub farms_mapped: usize,
    pub sensor_candidates: usize,
    pub telemetry_records: usize,
    pub mappings_fingerprint: String,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
    pub mappings: Vec<MappedFarm>,
}

/// Orchestrates the sequential mapping pipeline over a SQLite store and a
/// telemetry source. The store is opened per operation and released on every
/// exit path; the telemetry source sits behind a trait so callers choose the
/// remote API, a records file, or a test stub.
#[derive(Clone)]
pub struct FarmMapperApi {
    db_path: PathBuf,
    telemetry: Arc<dyn TelemetrySource + Send + Sync>,
}

impl std::fmt::Debug for FarmMapperApi {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FarmMapperApi").field("db_path", &self.db_path).finish_non_exhaustive()
    }
}

impl FarmMapperApi {
    #[must_use]
    pub fn new(db_path: PathBuf, telemetry: impl TelemetrySource + Send + Sync + 'static) -> Self {
        Self { db_path, telemetry: Arc::new(telemetry) }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Run the full geofence mapping pipeline for one user.
    ///
    /// Stages run strictly in sequence: load reference data, filter sensor
    /// candidates, resolve farm taxonomies, fetch telemetry (skipped when no
    /// candidate exists, called at most once otherwise), aggregate, and
    /// upsert one snapshot per farm. The first failing stage aborts the rest;
    /// upserts already committed in this run are not rolled back.
    ///
    /// # Errors
    /// Returns an error on any lookup, fetch, or persistence failure.
    pub fn map_user_farms(&self, user_id: &str) -> Result<MappingRunSummary> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let devices = store.list_devices(user_id)?;
        let device_types = store.list_taxonomy(TaxonomyKind::DeviceType)?;
        let sensors = sensor_candidates(&devices, &device_types)?;

        let farms = store.list_farms(user_id)?;
        let tables = store.taxonomy_tables()?;
        let resolved = farms
            .iter()
            .map(|farm| resolve_farm(farm, &tables))
            .collect::<Result<Vec<_>, _>>()?;

        let records = if sensors.is_empty() {
            Vec::new()
        } else {
            let sensor_ids =
                sensors.iter().map(|device| device.device_id.clone()).collect::<Vec<_>>();
            self.telemetry.fetch_records(&sensor_ids).context("telemetry fetch failed")?
        };

        let mappings = map_devices_to_farms(&resolved, &records);

        for mapping in &mappings {
            store
                .upsert_mapping(user_id, mapping)
                .with_context(|| format!("failed to persist mapping for farm {}", mapping.farm_id))?;
        }

        Ok(MappingRunSummary {
            run_id: MappingRunId::new(),
            user_id: user_id.to_string(),
            farms_mapped: mappings.len(),
            sensor_candidates: sensors.len(),
            telemetry_records: records.len(),
            mappings_fingerprint: mapping_fingerprint(&mappings)?,
            completed_at: OffsetDateTime::now_utc(),
            mappings,
        })
    }

    /// Load every persisted mapping snapshot for a user.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn list_mappings(&self, user_id: &str) -> Result<Vec<StoredMapping>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_mappings(user_id)
    }

    /// Fetch one persisted mapping snapshot.
    ///
    /// # Errors
    /// Returns an error when lookup fails or the snapshot does not exist.
    pub fn get_mapping(&self, user_id: &str, farm_id: &EntityId) -> Result<StoredMapping> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store
            .get_mapping(user_id, farm_id)?
            .ok_or_else(|| anyhow!("no mapping found for user {user_id}, farm {farm_id}"))
    }
}

/// SHA-256 digest of the canonical JSON of a run's mapped farms. Identical
/// farm and telemetry inputs yield identical fingerprints across runs.
///
/// # Errors
/// Returns an error when serialization fails.
pub fn mapping_fingerprint(mappings: &[MappedFarm]) -> Result<String> {
    let mut hasher = Sha256::new();
    for mapping in mappings {
        let line =
            serde_json::to_string(mapping).context("failed to serialize mapping fingerprint row")?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    Ok(format!("map_{}", &digest_hex[..16]))
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use farm_mapper_core::{
        Boundary, Coordinate, Device, Farm, TaxonomyEntry, TelemetryRecord,
        SOIL_SENSOR_TYPE_NAME,
    };

    use super::*;

    struct StubTelemetry {
        records: Vec<TelemetryRecord>,
        calls: Arc<AtomicUsize>,
    }

    impl TelemetrySource for StubTelemetry {
        fn fetch_records(&self, device_ids: &[EntityId]) -> Result<Vec<TelemetryRecord>> {
            assert!(!device_ids.is_empty(), "pipeline must skip empty fetches");
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.records.clone())
        }
    }

    struct FailingTelemetry;

    impl TelemetrySource for FailingTelemetry {
        fn fetch_records(&self, _device_ids: &[EntityId]) -> Result<Vec<TelemetryRecord>> {
            Err(anyhow!("telemetry backend unavailable"))
        }
    }

    fn unique_temp_db_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("farm-mapper-api-{tag}-{}.sqlite3", Ulid::new()))
    }

    fn square(min_lat: f64, min_lng: f64, side: f64) -> Boundary {
        Boundary::new(vec![
            Coordinate::new(min_lat, min_lng),
            Coordinate::new(min_lat, min_lng + side),
            Coordinate::new(min_lat + side, min_lng + side),
            Coordinate::new(min_lat + side, min_lng),
            Coordinate::new(min_lat, min_lng),
        ])
    }

    fn reading(device_id: &str, latitude: f64, longitude: f64) -> TelemetryRecord {
        TelemetryRecord {
            device_id: EntityId::new(device_id),
            location: Coordinate::new(latitude, longitude),
        }
    }

    fn seed_reference_data(db_path: &Path) -> Result<()> {
        let mut store = SqliteStore::open(db_path)?;
        store.migrate()?;

        for (kind, id, name) in [
            (TaxonomyKind::SoilType, "soil-1", "Clay Loam"),
            (TaxonomyKind::TerrainType, "terrain-1", "Flat"),
            (TaxonomyKind::WaterSource, "water-1", "Borewell"),
            (TaxonomyKind::DeviceType, "type-1", SOIL_SENSOR_TYPE_NAME),
            (TaxonomyKind::DeviceType, "type-2", "Weather Station"),
        ] {
            store.put_taxonomy_entry(
                kind,
                &TaxonomyEntry { id: EntityId::new(id), name: name.to_string() },
            )?;
        }

        for (farm_id, min_lat, min_lng) in [("farm-a", 0.0, 0.0), ("farm-b", 3.0, 3.0)] {
            store.put_farm(
                "user-1",
                &Farm {
                    farm_id: EntityId::new(farm_id),
                    boundary: square(min_lat, min_lng, 2.0),
                    soil_type_id: EntityId::new("soil-1"),
                    terrain_type_id: EntityId::new("terrain-1"),
                    water_source_id: EntityId::new("water-1"),
                },
            )?;
        }

        for (device_id, type_id) in [("d1", "type-1"), ("d2", "type-1"), ("d3", "type-2")] {
            store.put_device(
                "user-1",
                &Device {
                    device_id: EntityId::new(device_id),
                    device_type_id: EntityId::new(type_id),
                },
            )?;
        }

        Ok(())
    }

    // Test IDs: TAPI-001
    #[test]
    fn two_farm_run_maps_contained_device_and_persists_empty_farm() -> Result<()> {
        let db_path = unique_temp_db_path("two-farm");
        seed_reference_data(&db_path)?;

        let calls = Arc::new(AtomicUsize::new(0));
        let api = FarmMapperApi::new(
            db_path.clone(),
            StubTelemetry {
                records: vec![reading("d1", 1.0, 1.0), reading("d2", 10.0, 10.0)],
                calls: Arc::clone(&calls),
            },
        );

        let summary = api.map_user_farms("user-1")?;

        assert_eq!(summary.farms_mapped, 2);
        assert_eq!(summary.sensor_candidates, 2);
        assert_eq!(summary.telemetry_records, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let farm_a = api.get_mapping("user-1", &EntityId::new("farm-a"))?;
        assert_eq!(farm_a.devices, vec![EntityId::new("d1")]);
        assert_eq!(farm_a.soil_type, "Clay Loam");

        let farm_b = api.get_mapping("user-1", &EntityId::new("farm-b"))?;
        assert!(farm_b.devices.is_empty());
        assert_eq!(farm_b.water_source, "Borewell");

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn empty_sensor_subset_skips_the_telemetry_call() -> Result<()> {
        let db_path = unique_temp_db_path("no-sensors");
        {
            let mut store = SqliteStore::open(&db_path)?;
            store.migrate()?;
            store.put_taxonomy_entry(
                TaxonomyKind::SoilType,
                &TaxonomyEntry { id: EntityId::new("soil-1"), name: "Clay Loam".to_string() },
            )?;
            store.put_taxonomy_entry(
                TaxonomyKind::TerrainType,
                &TaxonomyEntry { id: EntityId::new("terrain-1"), name: "Flat".to_string() },
            )?;
            store.put_taxonomy_entry(
                TaxonomyKind::WaterSource,
                &TaxonomyEntry { id: EntityId::new("water-1"), name: "Borewell".to_string() },
            )?;
            store.put_taxonomy_entry(
                TaxonomyKind::DeviceType,
                &TaxonomyEntry {
                    id: EntityId::new("type-1"),
                    name: SOIL_SENSOR_TYPE_NAME.to_string(),
                },
            )?;
            store.put_farm(
                "user-1",
                &Farm {
                    farm_id: EntityId::new("farm-a"),
                    boundary: square(0.0, 0.0, 2.0),
                    soil_type_id: EntityId::new("soil-1"),
                    terrain_type_id: EntityId::new("terrain-1"),
                    water_source_id: EntityId::new("water-1"),
                },
            )?;
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let api = FarmMapperApi::new(
            db_path.clone(),
            StubTelemetry { records: Vec::new(), calls: Arc::clone(&calls) },
        );

        let summary = api.map_user_farms("user-1")?;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(summary.sensor_candidates, 0);
        assert_eq!(summary.telemetry_records, 0);
        assert_eq!(summary.farms_mapped, 1);
        assert!(summary.mappings[0].devices.is_empty());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn unresolvable_soil_type_aborts_before_fetch_and_persistence() -> Result<()> {
        let db_path = unique_temp_db_path("bad-soil");
        seed_reference_data(&db_path)?;
        {
            let mut store = SqliteStore::open(&db_path)?;
            store.migrate()?;
            store.put_farm(
                "user-1",
                &Farm {
                    farm_id: EntityId::new("farm-broken"),
                    boundary: square(7.0, 7.0, 2.0),
                    soil_type_id: EntityId::new("soil-missing"),
                    terrain_type_id: EntityId::new("terrain-1"),
                    water_source_id: EntityId::new("water-1"),
                },
            )?;
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let api = FarmMapperApi::new(
            db_path.clone(),
            StubTelemetry { records: Vec::new(), calls: Arc::clone(&calls) },
        );

        let err = match api.map_user_farms("user-1") {
            Ok(_) => panic!("run should abort on an unresolvable soil type id"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("soil_type"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(api.list_mappings("user-1")?.is_empty());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn telemetry_failure_aborts_before_any_persistence() -> Result<()> {
        let db_path = unique_temp_db_path("fetch-fail");
        seed_reference_data(&db_path)?;

        let api = FarmMapperApi::new(db_path.clone(), FailingTelemetry);

        let err = match api.map_user_farms("user-1") {
            Ok(_) => panic!("run should abort when the telemetry backend fails"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("telemetry fetch failed"));
        assert!(api.list_mappings("user-1")?.is_empty());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-005
    #[test]
    fn reruns_with_identical_inputs_share_a_fingerprint() -> Result<()> {
        let db_path = unique_temp_db_path("rerun");
        seed_reference_data(&db_path)?;

        let mk_api = |calls: Arc<AtomicUsize>| {
            FarmMapperApi::new(
                db_path.clone(),
                StubTelemetry {
                    records: vec![reading("d1", 1.0, 1.0), reading("d2", 4.0, 4.0)],
                    calls,
                },
            )
        };

        let first = mk_api(Arc::new(AtomicUsize::new(0))).map_user_farms("user-1")?;
        let second = mk_api(Arc::new(AtomicUsize::new(0))).map_user_farms("user-1")?;

        assert_eq!(first.mappings_fingerprint, second.mappings_fingerprint);
        assert_ne!(first.run_id, second.run_id);
        assert_eq!(first.mappings, second.mappings);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
