use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use farm_mapper_api::FarmMapperApi;
use farm_mapper_core::{
    Boundary, Coordinate, Device, EntityId, Farm, TaxonomyEntry, TaxonomyKind,
};
use farm_mapper_store_sqlite::SqliteStore;
use farm_mapper_telemetry::{FileTelemetrySource, HttpTelemetryClient};
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "fm")]
#[command(about = "Farm Mapper CLI")]
struct Cli {
    #[arg(long, default_value = "./farm_mapper.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Farm {
        #[command(subcommand)]
        command: FarmCommand,
    },
    Device {
        #[command(subcommand)]
        command: DeviceCommand,
    },
    Taxonomy {
        #[command(subcommand)]
        command: TaxonomyCommand,
    },
    Map {
        #[command(subcommand)]
        command: MapCommand,
    },
    Mapping {
        #[command(subcommand)]
        command: MappingCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum FarmCommand {
    Add(FarmAddArgs),
    List(UserArgs),
}

#[derive(Debug, Args)]
struct FarmAddArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    farm_id: String,
    /// Boundary ring as a JSON array of [latitude, longitude] pairs.
    #[arg(long)]
    boundary: String,
    #[arg(long)]
    soil_type_id: String,
    #[arg(long)]
    terrain_type_id: String,
    #[arg(long)]
    water_source_id: String,
}

#[derive(Debug, Subcommand)]
enum DeviceCommand {
    Add(DeviceAddArgs),
    List(UserArgs),
}

#[derive(Debug, Args)]
struct DeviceAddArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    device_id: String,
    #[arg(long)]
    device_type_id: String,
}

#[derive(Debug, Subcommand)]
enum TaxonomyCommand {
    Add(TaxonomyAddArgs),
    List(TaxonomyListArgs),
}

#[derive(Debug, Args)]
struct TaxonomyAddArgs {
    #[arg(long)]
    category: CategoryArg,
    #[arg(long)]
    id: String,
    #[arg(long)]
    name: String,
}

#[derive(Debug, Args)]
struct TaxonomyListArgs {
    #[arg(long)]
    category: CategoryArg,
}

#[derive(Debug, Subcommand)]
enum MapCommand {
    Run(MapRunArgs),
}

#[derive(Debug, Args)]
struct MapRunArgs {
    #[arg(long)]
    user: String,
    /// Serve telemetry from a JSON records file instead of the remote API.
    #[arg(long)]
    records_file: Option<PathBuf>,
    #[arg(long)]
    telemetry_endpoint: Option<String>,
}

#[derive(Debug, Subcommand)]
enum MappingCommand {
    List(UserArgs),
    Show(MappingShowArgs),
}

#[derive(Debug, Args)]
struct UserArgs {
    #[arg(long)]
    user: String,
}

#[derive(Debug, Args)]
struct MappingShowArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    farm_id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CategoryArg {
    SoilType,
    TerrainType,
    WaterSource,
    DeviceType,
}

impl CategoryArg {
    fn into_kind(self) -> TaxonomyKind {
        match self {
            Self::SoilType => TaxonomyKind::SoilType,
            Self::TerrainType => TaxonomyKind::TerrainType,
            Self::WaterSource => TaxonomyKind::WaterSource,
            Self::DeviceType => TaxonomyKind::DeviceType,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "cli_contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "cli_contract_version": CLI_CONTRACT_VERSION,
            "data": other,
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(command, &mut store)
        }
        Command::Farm { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            store.migrate()?;
            run_farm(command, &mut store)
        }
        Command::Device { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            store.migrate()?;
            run_device(command, &mut store)
        }
        Command::Taxonomy { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            store.migrate()?;
            run_taxonomy(command, &mut store)
        }
        Command::Map { command } => run_map(command, cli.db),
        Command::Mapping { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            store.migrate()?;
            run_mapping(command, &store)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::to_value(&status).context("failed to serialize schema status")?)
        }
        DbCommand::Migrate(args) => {
            let before = store.schema_status()?;
            if args.dry_run {
                return emit_json(serde_json::json!({
                    "dry_run": true,
                    "current_version": before.current_version,
                    "target_version": before.target_version,
                    "would_apply_versions": before.pending_versions,
                }));
            }

            store.migrate()?;
            let after = store.schema_status()?;
            emit_json(serde_json::json!({
                "dry_run": false,
                "current_version": before.current_version,
                "target_version": before.target_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "up_to_date": after.pending_versions.is_empty(),
            }))
        }
    }
}

fn run_farm(command: FarmCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        FarmCommand::Add(args) => {
            let farm = Farm {
                farm_id: EntityId::new(args.farm_id),
                boundary: parse_boundary(&args.boundary)?,
                soil_type_id: EntityId::new(args.soil_type_id),
                terrain_type_id: EntityId::new(args.terrain_type_id),
                water_source_id: EntityId::new(args.water_source_id),
            };
            store.put_farm(&args.user, &farm)?;
            emit_json(serde_json::json!({
                "user_id": args.user,
                "farm": serde_json::to_value(&farm).context("failed to serialize farm")?,
            }))
        }
        FarmCommand::List(args) => {
            let farms = store.list_farms(&args.user)?;
            emit_json(serde_json::json!({ "user_id": args.user, "farms": farms }))
        }
    }
}

fn run_device(command: DeviceCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DeviceCommand::Add(args) => {
            let device = Device {
                device_id: EntityId::new(args.device_id),
                device_type_id: EntityId::new(args.device_type_id),
            };
            store.put_device(&args.user, &device)?;
            emit_json(serde_json::json!({
                "user_id": args.user,
                "device": serde_json::to_value(&device).context("failed to serialize device")?,
            }))
        }
        DeviceCommand::List(args) => {
            let devices = store.list_devices(&args.user)?;
            emit_json(serde_json::json!({ "user_id": args.user, "devices": devices }))
        }
    }
}

fn run_taxonomy(command: TaxonomyCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        TaxonomyCommand::Add(args) => {
            let kind = args.category.into_kind();
            let entry = TaxonomyEntry { id: EntityId::new(args.id), name: args.name };
            store.put_taxonomy_entry(kind, &entry)?;
            emit_json(serde_json::json!({
                "category": kind.as_str(),
                "entry": serde_json::to_value(&entry)
                    .context("failed to serialize taxonomy entry")?,
            }))
        }
        TaxonomyCommand::List(args) => {
            let kind = args.category.into_kind();
            let entries = store.list_taxonomy(kind)?;
            emit_json(serde_json::json!({ "category": kind.as_str(), "entries": entries }))
        }
    }
}

fn run_map(command: MapCommand, db_path: PathBuf) -> Result<()> {
    match command {
        MapCommand::Run(args) => {
            let api = match (args.records_file, args.telemetry_endpoint) {
                (Some(path), None) => {
                    FarmMapperApi::new(db_path, FileTelemetrySource::new(path))
                }
                (None, Some(endpoint)) => {
                    FarmMapperApi::new(db_path, HttpTelemetryClient::new(endpoint))
                }
                (Some(_), Some(_)) => {
                    return Err(anyhow!(
                        "choose one telemetry source: --records-file or --telemetry-endpoint"
                    ));
                }
                (None, None) => {
                    return Err(anyhow!(
                        "a telemetry source is required: --records-file or --telemetry-endpoint"
                    ));
                }
            };

            let summary = api.map_user_farms(&args.user)?;
            emit_json(
                serde_json::to_value(&summary).context("failed to serialize run summary")?,
            )
        }
    }
}

fn run_mapping(command: MappingCommand, store: &SqliteStore) -> Result<()> {
    match command {
        MappingCommand::List(args) => {
            let mappings = store.list_mappings(&args.user)?;
            emit_json(serde_json::json!({ "user_id": args.user, "mappings": mappings }))
        }
        MappingCommand::Show(args) => {
            let farm_id = EntityId::new(args.farm_id);
            let Some(mapping) = store.get_mapping(&args.user, &farm_id)? else {
                return Err(anyhow!(
                    "no mapping found for user {}, farm {farm_id}",
                    args.user
                ));
            };
            emit_json(serde_json::to_value(&mapping).context("failed to serialize mapping")?)
        }
    }
}

fn parse_boundary(raw: &str) -> Result<Boundary> {
    let pairs: Vec<[f64; 2]> = serde_json::from_str(raw)
        .context("boundary must be a JSON array of [latitude, longitude] pairs")?;
    Ok(Boundary::new(
        pairs.into_iter().map(|pair| Coordinate::new(pair[0], pair[1])).collect(),
    ))
}
