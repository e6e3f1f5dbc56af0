//! Demonstration command-line client for the shard map catalog and
//! fan-out query engine.
//!
//! This is not a production database client: there is no real wire driver
//! here, so `query` runs against an in-memory [`FakeShardDriver`] seeded
//! with a handful of rows per shard. The point is to exercise the same
//! catalog-management and multi-shard-query surface a real driver-backed
//! client would use, end to end, from a single process.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meridian_api::{
    Catalog, ColumnSchema, ColumnType, EngineConfig, ExecutionOptions, ExecutionPolicy, MultiShardConnection, Row,
    Shard, ShardKeyType, ShardLocation, ShardMap, ShardMapKind, Value,
};
use meridian_executor::driver::fake::FakeShardDriver;
use meridian_retry::DefaultTransientErrorDetector;
use meridian_store::global::InMemoryGlobalStore;
use meridian_store::local::InMemoryLocalStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Catalog and query demonstration client.
#[derive(Parser)]
#[command(name = "meridian-cli")]
#[command(about = "Demonstration client for the shard map catalog and fan-out query engine")]
struct Cli {
    /// Enable debug-level logging.
    #[arg(short, long, env = "MERIDIAN_VERBOSE")]
    verbose: bool,

    /// Path to a JSON file holding an `EngineConfig` (load policy, retry
    /// policy, execution defaults). Falls back to `EngineConfig::default()`
    /// when not given. Overridden field-by-field by the flags above it in
    /// precedence (CLI args > env > file > built-in defaults).
    #[arg(long, env = "MERIDIAN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a shard map, add shards and mappings, and print the result.
    CreateMap {
        /// Name of the shard map to create.
        #[arg(long, default_value = "customers")]
        name: String,
        /// `list` or `range`.
        #[arg(long, default_value = "range")]
        kind: String,
        /// Number of shards to create and spread an Int32 key range over.
        #[arg(long, default_value_t = 3)]
        shard_count: u32,
    },
    /// List every shard map, its shards, and its mappings.
    ListMaps,
    /// Resolve a key against a map and print the owning shard.
    Lookup {
        #[arg(long)]
        map: String,
        #[arg(long)]
        key: i32,
    },
    /// Run a fan-out query against every shard of a map and print the rows.
    Query {
        #[arg(long)]
        map: String,
        #[arg(long, default_value = "SELECT id, name FROM customers")]
        sql: String,
        /// Fail the whole query if any shard faults, instead of returning
        /// the rows the surviving shards produced.
        #[arg(long)]
        complete_results: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(format!("meridian_cli={level}")).init();

    let engine_config = match &cli.config {
        Some(path) => EngineConfig::from_file(path).with_context(|| format!("reading config file '{}'", path.display()))?,
        None => EngineConfig::default(),
    };
    info!(load_policy = ?engine_config.load_policy, "resolved engine configuration");

    let catalog = Arc::new(Catalog::with_retry_policy(
        Arc::new(InMemoryGlobalStore::new()),
        engine_config.load_policy,
        engine_config.retry_policy,
    ));

    match cli.command {
        Command::CreateMap { name, kind, shard_count } => create_map(&catalog, &name, &kind, shard_count).await,
        Command::ListMaps => list_maps(&catalog),
        Command::Lookup { map, key } => lookup(&catalog, &map, key),
        Command::Query { map, sql, complete_results } => query(&catalog, &map, &sql, complete_results).await,
    }
}

fn parse_kind(kind: &str) -> Result<ShardMapKind> {
    match kind {
        "list" => Ok(ShardMapKind::List),
        "range" => Ok(ShardMapKind::Range),
        other => anyhow::bail!("unknown shard map kind '{other}', expected 'list' or 'range'"),
    }
}

/// Creates a map, registers a local store and a shard per `shard_count`,
/// then spreads an even Int32 range (or list entry) across them.
async fn create_map(catalog: &Arc<Catalog>, name: &str, kind: &str, shard_count: u32) -> Result<()> {
    let kind = parse_kind(kind)?;
    let core_map = catalog.create_map(name, kind, ShardKeyType::Int32).await.context("create_map failed")?;
    let map: ShardMap<i32> = ShardMap::new(catalog.clone(), core_map);
    info!("created shard map '{}' ({:?})", map.name(), map.kind());

    let step = (i32::MAX as i64 - i32::MIN as i64 + 1) / shard_count.max(1) as i64;
    let mut low = i32::MIN;
    for i in 0..shard_count {
        let location = ShardLocation::new(format!("server{i}"), format!("{name}_shard{i}"));
        catalog.register_local_store(location.clone(), Arc::new(InMemoryLocalStore::new()));
        let shard = map.create_shard(location.clone()).await.context("create_shard failed")?;

        match map.kind() {
            ShardMapKind::Range => {
                let high = if i + 1 == shard_count { i32::MAX } else { (low as i64 + step) as i32 };
                map.add_range_mapping(&shard, low, high).await.context("add_range_mapping failed")?;
                println!("shard {location} owns [{low}, {high})");
                low = high;
            }
            ShardMapKind::List => {
                map.add_list_mapping(&shard, i as i32).await.context("add_list_mapping failed")?;
                println!("shard {location} owns key {i}");
            }
        }
    }
    Ok(())
}

fn list_maps(catalog: &Arc<Catalog>) -> Result<()> {
    for core_map in catalog.list_maps() {
        println!("{} ({:?}, key type {:?})", core_map.name, core_map.kind, core_map.key_type);
        let map: ShardMap<i32> = ShardMap::new(catalog.clone(), core_map);
        for shard in map.list_shards() {
            println!("  shard {} [{:?}]", shard.location, shard.status);
        }
        match map.kind() {
            ShardMapKind::Range => {
                for mapping in map.list_range_mappings() {
                    println!("  range {:?}..{:?} -> shard {}", mapping.low, mapping.high, mapping.shard_id);
                }
            }
            ShardMapKind::List => {
                for mapping in map.list_list_mappings() {
                    println!("  point {:?} -> shard {}", mapping.key, mapping.shard_id);
                }
            }
        }
    }
    Ok(())
}

fn lookup(catalog: &Arc<Catalog>, map_name: &str, key: i32) -> Result<()> {
    let core_map = catalog.get_map(map_name)?;
    let map: ShardMap<i32> = ShardMap::new(catalog.clone(), core_map);
    let shard = map.get_shard_for_key(key)?;
    println!("key {key} -> shard {}", shard.location);
    Ok(())
}

/// Runs a fan-out query against every shard currently holding a mapping in
/// `map_name`, using a [`FakeShardDriver`] seeded with two rows per shard so
/// there is something to print without a real backing database.
async fn query(catalog: &Arc<Catalog>, map_name: &str, sql: &str, complete_results: bool) -> Result<()> {
    let core_map = catalog.get_map(map_name)?;
    let typed_map: ShardMap<i32> = ShardMap::new(catalog.clone(), core_map);
    let shards: Vec<Shard> = typed_map.list_shards();
    if shards.is_empty() {
        anyhow::bail!("map '{map_name}' has no shards");
    }

    let schema = vec![
        ColumnSchema { name: "id".into(), data_type: ColumnType::Int32 },
        ColumnSchema { name: "name".into(), data_type: ColumnType::String },
    ];
    let mut driver = FakeShardDriver::new(schema);
    let connection_template = "Integrated Security=True";
    for (i, shard) in shards.iter().enumerate() {
        let connection_string =
            meridian_executor::build_connection_string(connection_template, &shard.location, ";Application Name Suffix=MultiShardQuery");
        driver.register(
            connection_string,
            vec![
                Row { values: vec![Value::Int32(i as i32 * 2), Value::String(format!("row-{i}-a"))] },
                Row { values: vec![Value::Int32(i as i32 * 2 + 1), Value::String(format!("row-{i}-b"))] },
            ],
        );
    }

    let connection = MultiShardConnection::new(
        Arc::new(driver),
        shards.into_iter().map(|s| s.location).collect(),
        connection_template,
        Default::default(),
        Arc::new(DefaultTransientErrorDetector),
    );
    let mut command = connection.create_command(sql);
    command.set_execution_policy(if complete_results { ExecutionPolicy::CompleteResults } else { ExecutionPolicy::PartialResults });
    command.set_execution_options(ExecutionOptions::IncludeShardNameColumn);

    let reader = command.execute_reader_async().await?;
    let field_count = reader.field_count();
    let mut row_count = 0usize;
    while reader.read_async().await? {
        let mut fields = Vec::with_capacity(field_count);
        for ordinal in 0..field_count {
            fields.push(format!("{:?}", reader.get_value(ordinal)?));
        }
        println!("{}", fields.join(" | "));
        row_count += 1;
    }
    for fault in reader.multi_shard_exceptions() {
        eprintln!("shard {} faulted: {}", fault.shard_location, fault.inner);
    }
    println!("{row_count} rows");
    Ok(())
}
