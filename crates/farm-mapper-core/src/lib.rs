use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use geo::{point, Intersects, LineString, Polygon};
use serde::{Deserialize, Serialize};

/// Display name of the taxonomy entry that marks a device as a sensor
/// candidate for geofence mapping.
pub const SOIL_SENSOR_TYPE_NAME: &str = "Soil Sensor";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MapperError {
    #[error("no matching {category} entry for id {id}")]
    UnknownTaxonomyId { category: TaxonomyKind, id: EntityId },
    #[error("{category} taxonomy has no entry named {name:?}")]
    MissingTaxonomyName { category: TaxonomyKind, name: String },
}

/// Canonical string form of an entity identifier.
///
/// Identifiers reach this crate from subsystems that disagree on their wire
/// type (string in one collection, integer in another), so every ID is
/// normalized to its string form at the deserialization boundary and every
/// join compares the normalized form.
#[derive(Debug, Clone, Serialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntityId(String);

impl EntityId {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for EntityId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Number(i64),
        }

        match RawId::deserialize(deserializer)? {
            RawId::Text(value) => Ok(Self(value)),
            RawId::Number(value) => Ok(Self(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    #[must_use]
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// Ordered ring of vertices describing a farm's geofenced area.
///
/// Rings are stored exactly as registered; polygon construction closes an
/// open ring, so the final vertex does not have to repeat the first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Boundary(Vec<Coordinate>);

impl Boundary {
    #[must_use]
    pub fn new(vertices: Vec<Coordinate>) -> Self {
        Self(vertices)
    }

    #[must_use]
    pub fn vertices(&self) -> &[Coordinate] {
        &self.0
    }

    fn to_polygon(&self) -> Polygon<f64> {
        let ring = self
            .0
            .iter()
            .map(|vertex| (vertex.longitude, vertex.latitude))
            .collect::<Vec<_>>();
        Polygon::new(LineString::from(ring), vec![])
    }

    /// Boundary-inclusive containment test: true when the point lies inside
    /// the ring or exactly on an edge or vertex.
    #[must_use]
    pub fn contains(&self, location: Coordinate) -> bool {
        let probe = point!(x: location.longitude, y: location.latitude);
        self.to_polygon().intersects(&probe)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaxonomyKind {
    SoilType,
    TerrainType,
    WaterSource,
    DeviceType,
}

impl TaxonomyKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SoilType => "soil_type",
            Self::TerrainType => "terrain_type",
            Self::WaterSource => "water_source",
            Self::DeviceType => "device_type",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "soil_type" => Some(Self::SoilType),
            "terrain_type" => Some(Self::TerrainType),
            "water_source" => Some(Self::WaterSource),
            "device_type" => Some(Self::DeviceType),
            _ => None,
        }
    }
}

impl Display for TaxonomyKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One reference-table row mapping a categorical ID to a display name.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TaxonomyEntry {
    pub id: EntityId,
    pub name: String,
}

/// The three lookup tables a farm's categorical IDs resolve against.
#[derive(Debug, Clone, Default)]
pub struct TaxonomyTables {
    pub soil_types: Vec<TaxonomyEntry>,
    pub terrain_types: Vec<TaxonomyEntry>,
    pub water_sources: Vec<TaxonomyEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Farm {
    pub farm_id: EntityId,
    pub boundary: Boundary,
    pub soil_type_id: EntityId,
    pub terrain_type_id: EntityId,
    pub water_source_id: EntityId,
}

/// A farm whose categorical IDs have been replaced by display names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedFarm {
    pub farm_id: EntityId,
    pub boundary: Boundary,
    pub soil_type: String,
    pub terrain_type: String,
    pub water_source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Device {
    pub device_id: EntityId,
    pub device_type_id: EntityId,
}

/// One current location reading for a device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryRecord {
    pub device_id: EntityId,
    pub location: Coordinate,
}

/// Per-farm aggregate produced by each mapping run: the farm's static
/// attributes plus the devices currently contained by its boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappedFarm {
    pub farm_id: EntityId,
    pub devices: Vec<EntityId>,
    pub location: Boundary,
    pub soil_type: String,
    pub terrain_type: String,
    pub water_source: String,
}

/// Find the display name for `id` within one taxonomy table.
///
/// # Errors
/// Returns [`MapperError::UnknownTaxonomyId`] when no entry carries the ID.
pub fn lookup_name(
    entries: &[TaxonomyEntry],
    category: TaxonomyKind,
    id: &EntityId,
) -> Result<String, MapperError> {
    entries
        .iter()
        .find(|entry| entry.id == *id)
        .map(|entry| entry.name.clone())
        .ok_or_else(|| MapperError::UnknownTaxonomyId { category, id: id.clone() })
}

/// Find the entry ID carrying display name `name` within one taxonomy table.
///
/// # Errors
/// Returns [`MapperError::MissingTaxonomyName`] when no entry carries the name.
pub fn lookup_id_by_name(
    entries: &[TaxonomyEntry],
    category: TaxonomyKind,
    name: &str,
) -> Result<EntityId, MapperError> {
    entries
        .iter()
        .find(|entry| entry.name == name)
        .map(|entry| entry.id.clone())
        .ok_or_else(|| MapperError::MissingTaxonomyName { category, name: name.to_string() })
}

/// Resolve a farm's soil, terrain, and water-source IDs to display names.
///
/// # Errors
/// Returns [`MapperError::UnknownTaxonomyId`] for the first category whose ID
/// has no matching table entry; resolution is all-or-nothing per farm.
pub fn resolve_farm(farm: &Farm, tables: &TaxonomyTables) -> Result<ResolvedFarm, MapperError> {
    let soil_type = lookup_name(&tables.soil_types, TaxonomyKind::SoilType, &farm.soil_type_id)?;
    let terrain_type =
        lookup_name(&tables.terrain_types, TaxonomyKind::TerrainType, &farm.terrain_type_id)?;
    let water_source =
        lookup_name(&tables.water_sources, TaxonomyKind::WaterSource, &farm.water_source_id)?;

    Ok(ResolvedFarm {
        farm_id: farm.farm_id.clone(),
        boundary: farm.boundary.clone(),
        soil_type,
        terrain_type,
        water_source,
    })
}

/// Filter the device list down to sensor candidates: devices whose type
/// matches the canonical [`SOIL_SENSOR_TYPE_NAME`] taxonomy entry.
///
/// An empty result is valid and means no telemetry lookup is needed.
///
/// # Errors
/// Returns [`MapperError::MissingTaxonomyName`] when the device-type taxonomy
/// has no soil-sensor entry at all.
pub fn sensor_candidates(
    devices: &[Device],
    device_types: &[TaxonomyEntry],
) -> Result<Vec<Device>, MapperError> {
    let sensor_type_id =
        lookup_id_by_name(device_types, TaxonomyKind::DeviceType, SOIL_SENSOR_TYPE_NAME)?;

    Ok(devices
        .iter()
        .filter(|device| device.device_type_id == sensor_type_id)
        .cloned()
        .collect())
}

/// Aggregate telemetry readings into one [`MappedFarm`] per farm.
///
/// Every record is tested against every farm boundary; a record landing in
/// more than one overlapping farm is appended to each of them, and repeated
/// records for the same device are appended repeatedly. Farms with no
/// contained reading still emit an entry with an empty device list. Output
/// follows the farm enumeration order; per-farm device order follows record
/// iteration order.
#[must_use]
pub fn map_devices_to_farms(
    farms: &[ResolvedFarm],
    records: &[TelemetryRecord],
) -> Vec<MappedFarm> {
    let mut devices_by_farm: BTreeMap<EntityId, Vec<EntityId>> = BTreeMap::new();

    for record in records {
        for farm in farms {
            if farm.boundary.contains(record.location) {
                devices_by_farm
                    .entry(farm.farm_id.clone())
                    .or_default()
                    .push(record.device_id.clone());
            }
        }
    }

    farms
        .iter()
        .map(|farm| MappedFarm {
            farm_id: farm.farm_id.clone(),
            devices: devices_by_farm.get(&farm.farm_id).cloned().unwrap_or_default(),
            location: farm.boundary.clone(),
            soil_type: farm.soil_type.clone(),
            terrain_type: farm.terrain_type.clone(),
            water_source: farm.water_source.clone(),
        })
        .collect()
}
