use std::path::Path;

use anyhow::{anyhow, Context, Result};
use farm_mapper_core::{
    Boundary, Device, EntityId, Farm, MappedFarm, TaxonomyEntry, TaxonomyKind, TaxonomyTables,
};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS user_farms (
  user_id TEXT NOT NULL,
  farm_id TEXT NOT NULL,
  boundary_json TEXT NOT NULL,
  soil_type_id TEXT NOT NULL,
  terrain_type_id TEXT NOT NULL,
  water_source_id TEXT NOT NULL,
  PRIMARY KEY (user_id, farm_id)
);

CREATE TABLE IF NOT EXISTS user_devices (
  user_id TEXT NOT NULL,
  device_id TEXT NOT NULL,
  device_type_id TEXT NOT NULL,
  PRIMARY KEY (user_id, device_id)
);

CREATE TABLE IF NOT EXISTS taxonomy_entries (
  category TEXT NOT NULL CHECK (category IN ('soil_type','terrain_type','water_source','device_type')),
  entry_id TEXT NOT NULL,
  name TEXT NOT NULL,
  PRIMARY KEY (category, entry_id)
);

CREATE TABLE IF NOT EXISTS farm_device_mappings (
  user_id TEXT NOT NULL,
  farm_id TEXT NOT NULL,
  devices_json TEXT NOT NULL,
  location_json TEXT NOT NULL,
  soil_type TEXT NOT NULL,
  terrain_type TEXT NOT NULL,
  water_source TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (user_id, farm_id)
);

CREATE INDEX IF NOT EXISTS idx_user_farms_user ON user_farms(user_id);
CREATE INDEX IF NOT EXISTS idx_user_devices_user ON user_devices(user_id);
CREATE INDEX IF NOT EXISTS idx_farm_device_mappings_user ON farm_device_mappings(user_id);
";

/// SQLite store backing the reference-data collections and the per-farm
/// mapping snapshots. One instance owns one connection; callers open a store
/// per pipeline invocation and drop it on every exit path.
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// One persisted mapping snapshot, keyed by `(user_id, farm_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMapping {
    pub user_id: String,
    pub farm_id: EntityId,
    pub devices: Vec<EntityId>,
    pub location: Boundary,
    pub soil_type: String,
    pub terrain_type: String,
    pub water_source: String,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SqliteStore {
    /// Open a SQLite-backed store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step
    /// fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Insert or replace one registered farm for a user.
    ///
    /// # Errors
    /// Returns an error when serialization or the write fails.
    pub fn put_farm(&mut self, user_id: &str, farm: &Farm) -> Result<()> {
        let boundary_json =
            serde_json::to_string(&farm.boundary).context("failed to serialize farm boundary")?;

        self.conn
            .execute(
                "INSERT INTO user_farms(
                    user_id, farm_id, boundary_json, soil_type_id, terrain_type_id, water_source_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(user_id, farm_id) DO UPDATE SET
                    boundary_json = excluded.boundary_json,
                    soil_type_id = excluded.soil_type_id,
                    terrain_type_id = excluded.terrain_type_id,
                    water_source_id = excluded.water_source_id",
                params![
                    user_id,
                    farm.farm_id.as_str(),
                    boundary_json,
                    farm.soil_type_id.as_str(),
                    farm.terrain_type_id.as_str(),
                    farm.water_source_id.as_str(),
                ],
            )
            .context("failed to insert farm")?;
        Ok(())
    }

    /// Load every farm registered for a user, in stable `farm_id` order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_farms(&self, user_id: &str) -> Result<Vec<Farm>> {
        let mut stmt = self.conn.prepare(
            "SELECT farm_id, boundary_json, soil_type_id, terrain_type_id, water_source_id
             FROM user_farms
             WHERE user_id = ?1
             ORDER BY farm_id ASC",
        )?;

        let mut rows = stmt.query(params![user_id])?;
        let mut farms = Vec::new();

        while let Some(row) = rows.next()? {
            let boundary_json: String = row.get(1)?;
            farms.push(Farm {
                farm_id: EntityId::new(row.get::<_, String>(0)?),
                boundary: serde_json::from_str(&boundary_json)
                    .context("failed to deserialize farm boundary")?,
                soil_type_id: EntityId::new(row.get::<_, String>(2)?),
                terrain_type_id: EntityId::new(row.get::<_, String>(3)?),
                water_source_id: EntityId::new(row.get::<_, String>(4)?),
            });
        }

        Ok(farms)
    }

    /// Insert or replace one registered device for a user.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn put_device(&mut self, user_id: &str, device: &Device) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO user_devices(user_id, device_id, device_type_id)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id, device_id) DO UPDATE SET
                     device_type_id = excluded.device_type_id",
                params![user_id, device.device_id.as_str(), device.device_type_id.as_str()],
            )
            .context("failed to insert device")?;
        Ok(())
    }

    /// Load every device registered for a user, in stable `device_id` order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_devices(&self, user_id: &str) -> Result<Vec<Device>> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id, device_type_id
             FROM user_devices
             WHERE user_id = ?1
             ORDER BY device_id ASC",
        )?;

        let rows = stmt.query_map(params![user_id], |row| {
            Ok(Device {
                device_id: EntityId::new(row.get::<_, String>(0)?),
                device_type_id: EntityId::new(row.get::<_, String>(1)?),
            })
        })?;

        let mut devices = Vec::new();
        for row in rows {
            devices.push(row?);
        }

        Ok(devices)
    }

    /// Insert or replace one taxonomy entry under a category.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn put_taxonomy_entry(&mut self, kind: TaxonomyKind, entry: &TaxonomyEntry) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO taxonomy_entries(category, entry_id, name)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(category, entry_id) DO UPDATE SET name = excluded.name",
                params![kind.as_str(), entry.id.as_str(), entry.name],
            )
            .with_context(|| format!("failed to insert {kind} taxonomy entry"))?;
        Ok(())
    }

    /// Load one taxonomy table, in stable `entry_id` order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_taxonomy(&self, kind: TaxonomyKind) -> Result<Vec<TaxonomyEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT entry_id, name FROM taxonomy_entries
             WHERE category = ?1
             ORDER BY entry_id ASC",
        )?;

        let rows = stmt.query_map(params![kind.as_str()], |row| {
            Ok(TaxonomyEntry {
                id: EntityId::new(row.get::<_, String>(0)?),
                name: row.get(1)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }

        Ok(entries)
    }

    /// Load the three farm-attribute taxonomy tables in one call.
    ///
    /// # Errors
    /// Returns an error when any table cannot be read.
    pub fn taxonomy_tables(&self) -> Result<TaxonomyTables> {
        Ok(TaxonomyTables {
            soil_types: self.list_taxonomy(TaxonomyKind::SoilType)?,
            terrain_types: self.list_taxonomy(TaxonomyKind::TerrainType)?,
            water_sources: self.list_taxonomy(TaxonomyKind::WaterSource)?,
        })
    }

    /// Upsert one mapping snapshot keyed by `(user_id, farm_id)`.
    ///
    /// Each run fully overwrites the previous snapshot for the key; there is
    /// no history and no rollback of earlier upserts within the same run.
    ///
    /// # Errors
    /// Returns an error when serialization or the write fails.
    pub fn upsert_mapping(&mut self, user_id: &str, mapping: &MappedFarm) -> Result<()> {
        let devices_json = serde_json::to_string(&mapping.devices)
            .context("failed to serialize mapped device list")?;
        let location_json = serde_json::to_string(&mapping.location)
            .context("failed to serialize mapped farm location")?;

        self.conn
            .execute(
                "INSERT INTO farm_device_mappings(
                    user_id, farm_id, devices_json, location_json,
                    soil_type, terrain_type, water_source, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(user_id, farm_id) DO UPDATE SET
                    devices_json = excluded.devices_json,
                    location_json = excluded.location_json,
                    soil_type = excluded.soil_type,
                    terrain_type = excluded.terrain_type,
                    water_source = excluded.water_source,
                    updated_at = excluded.updated_at",
                params![
                    user_id,
                    mapping.farm_id.as_str(),
                    devices_json,
                    location_json,
                    mapping.soil_type,
                    mapping.terrain_type,
                    mapping.water_source,
                    now_rfc3339()?,
                ],
            )
            .with_context(|| format!("failed to upsert mapping for farm {}", mapping.farm_id))?;
        Ok(())
    }

    /// Fetch one mapping snapshot by key.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_mapping(&self, user_id: &str, farm_id: &EntityId) -> Result<Option<StoredMapping>> {
        let mut stmt = self.conn.prepare(
            "SELECT devices_json, location_json, soil_type, terrain_type, water_source, updated_at
             FROM farm_device_mappings
             WHERE user_id = ?1 AND farm_id = ?2",
        )?;

        let mut rows = stmt.query(params![user_id, farm_id.as_str()])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        Ok(Some(decode_mapping_row(user_id, farm_id.clone(), row)?))
    }

    /// Load every mapping snapshot persisted for a user, in stable order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_mappings(&self, user_id: &str) -> Result<Vec<StoredMapping>> {
        let mut stmt = self.conn.prepare(
            "SELECT farm_id, devices_json, location_json, soil_type, terrain_type, water_source, updated_at
             FROM farm_device_mappings
             WHERE user_id = ?1
             ORDER BY farm_id ASC",
        )?;

        let mut rows = stmt.query(params![user_id])?;
        let mut mappings = Vec::new();

        while let Some(row) = rows.next()? {
            let farm_id = EntityId::new(row.get::<_, String>(0)?);
            let devices_json: String = row.get(1)?;
            let location_json: String = row.get(2)?;
            mappings.push(StoredMapping {
                user_id: user_id.to_string(),
                farm_id,
                devices: serde_json::from_str(&devices_json)
                    .context("failed to deserialize mapped device list")?,
                location: serde_json::from_str(&location_json)
                    .context("failed to deserialize mapped farm location")?,
                soil_type: row.get(3)?,
                terrain_type: row.get(4)?,
                water_source: row.get(5)?,
                updated_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
            });
        }

        Ok(mappings)
    }
}

fn decode_mapping_row(
    user_id: &str,
    farm_id: EntityId,
    row: &rusqlite::Row<'_>,
) -> Result<StoredMapping> {
    let devices_json: String = row.get(0)?;
    let location_json: String = row.get(1)?;

    Ok(StoredMapping {
        user_id: user_id.to_string(),
        farm_id,
        devices: serde_json::from_str(&devices_json)
            .context("failed to deserialize mapped device list")?,
        location: serde_json::from_str(&location_json)
            .context("failed to deserialize mapped farm location")?,
        soil_type: row.get(2)?,
        terrain_type: row.get(3)?,
        water_source: row.get(4)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
