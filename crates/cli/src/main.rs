use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use vicinity_api::{ApiError, InProcApi, Operation, Settings, VicinityApi};
use vicinity_core::planner::{BoundsPlanner, GeohashPlanner};
use vicinity_core::{Coordinate, Entity, EntityId, Filter, GeoKey, Tier, Value};
use vicinity_persist::SqliteStore;
use vicinity_search::SearchOpts;
use vicinity_store::GeoStore;

#[derive(Parser, Debug)]
#[command(name = "vicinityctl", version, about = "Vicinity proximity search CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// SQLite database path (default: VICINITY_DB_PATH or ~/.vicinity/vicinity.db)
    #[arg(long = "db", global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug)]
struct Area {
    /// Center latitude in degrees
    lat: f64,
    /// Center longitude in degrees
    lng: f64,
    /// Radius in meters
    radius_m: f64,
}

impl Area {
    fn center(&self) -> Result<Coordinate> {
        Ok(Coordinate::new(self.lat, self.lng)?)
    }
}

#[derive(Args, Debug, Default)]
struct FilterArgs {
    /// Attribute equals value
    #[arg(long = "eq", value_name = "KEY=VALUE")]
    eq: Vec<String>,
    /// Attribute is one of the values
    #[arg(long = "in", value_name = "KEY=A,B")]
    in_list: Vec<String>,
    /// List attribute contains value
    #[arg(long = "contains", value_name = "KEY=VALUE")]
    contains: Vec<String>,
    /// List attribute contains any of the values
    #[arg(long = "contains-any", value_name = "KEY=A,B")]
    contains_any: Vec<String>,
}

impl FilterArgs {
    fn build(&self) -> Result<Vec<Filter>> {
        let mut out = Vec::new();
        for raw in &self.eq {
            let (k, v) = split_pair(raw)?;
            out.push(Filter::equals(k, parse_value(v))?);
        }
        for raw in &self.in_list {
            let (k, v) = split_pair(raw)?;
            out.push(Filter::in_list(k, v.split(',').map(parse_value))?);
        }
        for raw in &self.contains {
            let (k, v) = split_pair(raw)?;
            out.push(Filter::array_contains(k, parse_value(v))?);
        }
        for raw in &self.contains_any {
            let (k, v) = split_pair(raw)?;
            out.push(Filter::array_contains_any(k, v.split(',').map(parse_value))?);
        }
        Ok(out)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the geohash ranges a query circle maps to
    #[command(allow_negative_numbers = true)]
    Plan {
        #[command(flatten)]
        area: Area,
        /// Cell budget for refinement (default: VICINITY_MAX_CELLS or 16)
        #[arg(long = "max-cells")]
        max_cells: Option<usize>,
    },
    /// Insert or replace an entity
    #[command(allow_negative_numbers = true)]
    Put {
        lat: f64,
        lng: f64,
        /// Entity id (default: a new random id)
        #[arg(long = "id")]
        id: Option<String>,
        #[arg(long = "tier", default_value_t = 0)]
        tier: u8,
        #[arg(long = "credits", default_value_t = 0)]
        credits: u32,
        /// Scalar attribute (repeatable)
        #[arg(long = "attr", value_name = "KEY=VALUE")]
        attrs: Vec<String>,
        /// List attribute (repeatable)
        #[arg(long = "list", value_name = "KEY=A,B")]
        lists: Vec<String>,
    },
    /// Move an entity
    #[command(allow_negative_numbers = true)]
    Relocate { id: String, lat: f64, lng: f64 },
    /// Delete an entity
    Remove { id: String },
    /// Ranked proximity search
    #[command(allow_negative_numbers = true)]
    Search {
        #[command(flatten)]
        area: Area,
        #[command(flatten)]
        filters: FilterArgs,
        /// Limit results (applied after ranking)
        #[arg(long = "limit")]
        limit: Option<usize>,
        /// Deadline for the whole search (default: VICINITY_SEARCH_TIMEOUT_MS or 5000)
        #[arg(long = "timeout-ms")]
        timeout_ms: Option<u64>,
        /// Return partial results when some ranges fail
        #[arg(long = "lenient", action = ArgAction::SetTrue)]
        lenient: bool,
        /// Order by distance instead of tier/recency
        #[arg(long = "by-distance", action = ArgAction::SetTrue)]
        by_distance: bool,
        /// Print pipeline counters
        #[arg(long = "explain", action = ArgAction::SetTrue)]
        explain: bool,
    },
    /// Where an entity ranks in an area
    #[command(allow_negative_numbers = true)]
    Position {
        id: String,
        #[command(flatten)]
        area: Area,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Spend one credit to refresh an entity's recency
    Boost { id: String },
}

fn init_tracing() {
    let env = std::env::var("VICINITY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("VICINITY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid VICINITY_METRICS_ADDR; expected host:port");
        }
    }
}

fn split_pair(raw: &str) -> Result<(&str, &str)> {
    match raw.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim(), v.trim())),
        _ => bail!("expected KEY=VALUE, got {:?}", raw),
    }
}

/// `true`/`false` and integers keep their type; everything else is a string.
fn parse_value(raw: &str) -> Value {
    let raw = raw.trim();
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => raw.parse::<i64>().map(Value::Int).unwrap_or_else(|_| Value::Str(raw.to_string())),
    }
}

fn open_store(db: Option<&str>) -> Result<SqliteStore> {
    match db {
        Some(path) => SqliteStore::open(path),
        None => SqliteStore::open_default(),
    }
}

/// Print what the user should see for a failed call. Notices are not process failures.
fn report(err: ApiError, op: Operation, output: Output) -> Result<()> {
    let notice = err.notice(op);
    match (output, notice.message()) {
        (Output::Json, _) => {
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "error": err, "notice": notice }))?);
            Ok(())
        }
        (Output::Human, Some(msg)) => {
            warn!(error = %err, "request degraded to notice");
            println!("{}", msg);
            Ok(())
        }
        (Output::Human, None) => Err(anyhow!(err)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let settings = Settings::from_env();

    match cli.command {
        Commands::Plan { area, max_cells } => {
            let center = area.center()?;
            let planner = GeohashPlanner::new(max_cells.unwrap_or(settings.max_cells));
            let precision = planner.precision_for(&center, area.radius_m)?;
            let intervals = planner.plan(&center, area.radius_m)?;
            info!(precision, intervals = intervals.len(), "plan computed");
            match cli.output {
                Output::Human => {
                    println!("precision: {}", precision);
                    for iv in &intervals {
                        println!("{}", iv);
                    }
                }
                Output::Json => {
                    println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "precision": precision, "intervals": intervals }))?);
                }
            }
        }
        Commands::Put { lat, lng, id, tier, credits, attrs, lists } => {
            let store = open_store(cli.db.as_deref())?;
            let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let mut entity = Entity::new(EntityId::parse(id)?)
                .with_location(Coordinate::new(lat, lng)?)?
                .with_tier(Tier(tier))
                .with_credits(credits);
            for raw in &attrs {
                let (k, v) = split_pair(raw)?;
                entity = entity.with_attr(k, parse_value(v));
            }
            for raw in &lists {
                let (k, v) = split_pair(raw)?;
                entity = entity.with_attr(k, Value::List(v.split(',').map(parse_value).collect()));
            }
            let hash = entity.location.as_ref().map(|l| l.hash().to_string()).unwrap_or_default();
            store.put(entity.clone()).await.context("put")?;
            match cli.output {
                Output::Human => println!("{} stored at {}", entity.id, hash),
                Output::Json => println!("{}", serde_json::to_string_pretty(&entity)?),
            }
        }
        Commands::Relocate { id, lat, lng } => {
            let store = open_store(cli.db.as_deref())?;
            let id = EntityId::parse(id)?;
            let key = GeoKey::new(Coordinate::new(lat, lng)?)?;
            store.relocate(&id, key.clone()).await.with_context(|| format!("relocate {}", id))?;
            match cli.output {
                Output::Human => println!("{} moved to {}", id, key.hash()),
                Output::Json => println!("{}", serde_json::to_string_pretty(&key)?),
            }
        }
        Commands::Remove { id } => {
            let store = open_store(cli.db.as_deref())?;
            let id = EntityId::parse(id)?;
            let removed = store.remove(&id).await.with_context(|| format!("remove {}", id))?;
            match cli.output {
                Output::Human => println!("{} {}", id, if removed { "removed" } else { "not found" }),
                Output::Json => println!("{}", serde_json::json!({ "id": id, "removed": removed })),
            }
        }
        Commands::Search { area, filters, limit, timeout_ms, lenient, by_distance, explain } => {
            let filters = filters.build()?;
            let settings = Settings {
                search_timeout: timeout_ms.map(Duration::from_millis).unwrap_or(settings.search_timeout),
                lenient_search: lenient || settings.lenient_search,
                ..settings
            };
            let api = InProcApi::new(Arc::new(open_store(cli.db.as_deref())?), settings);
            let mut opts = SearchOpts { limit, ..SearchOpts::default() };
            if by_distance {
                opts = opts.by_distance();
            }
            info!(lat = area.lat, lng = area.lng, radius_m = area.radius_m, filters = filters.len(), "search invoked");
            let resp = match api.search(area.center()?, area.radius_m, filters, opts).await {
                Ok(resp) => resp,
                Err(e) => return report(e, Operation::Search, cli.output),
            };
            match cli.output {
                Output::Human => {
                    println!("{:<4} {:<24} {:>4} {:>10} {:<24}", "#", "ID", "TIER", "DIST_M", "RECENCY");
                    for (i, c) in resp.candidates.iter().enumerate() {
                        println!(
                            "{:<4} {:<24} {:>4} {:>10.1} {:<24}",
                            i + 1,
                            c.entity.id,
                            c.entity.tier.0,
                            c.distance_m,
                            c.entity.recency_at.to_rfc3339()
                        );
                    }
                    if resp.candidates.is_empty() {
                        println!("No nearby matches found");
                    }
                    if resp.debug.partial {
                        eprintln!("warning: {} range queries failed; results are partial", resp.debug.failed_intervals);
                    }
                    if explain {
                        let d = &resp.debug;
                        eprintln!(
                            "debug: intervals={} raw_hits={} after_dedup={} after_distance={} returned={} failed_intervals={} partial={} took_ms={}",
                            d.intervals, d.raw_hits, d.after_dedup, d.after_distance, d.returned, d.failed_intervals, d.partial, resp.took_ms
                        );
                    }
                }
                Output::Json => {
                    if explain {
                        println!("{}", serde_json::to_string_pretty(&resp)?);
                    } else {
                        println!("{}", serde_json::to_string_pretty(&resp.candidates)?);
                    }
                }
            }
        }
        Commands::Position { id, area, filters } => {
            let filters = filters.build()?;
            let api = InProcApi::new(Arc::new(open_store(cli.db.as_deref())?), settings);
            let (position, found) = match api.my_position(area.center()?, area.radius_m, filters, &id).await {
                Ok(p) => p,
                Err(e) => return report(e, Operation::Position, cli.output),
            };
            match cli.output {
                Output::Human if found => println!("{} is #{}", id, position),
                Output::Human => println!("{} is not in this area", id),
                Output::Json => println!("{}", serde_json::json!({ "id": id, "position": position, "found": found })),
            }
        }
        Commands::Boost { id } => {
            let api = InProcApi::new(Arc::new(open_store(cli.db.as_deref())?), settings);
            let receipt = match api.boost(&id).await {
                Ok(r) => r,
                Err(e) => return report(e, Operation::Boost, cli.output),
            };
            match cli.output {
                Output::Human => println!(
                    "{} boosted at {}; {} credits left",
                    id,
                    receipt.recency_at.to_rfc3339(),
                    receipt.remaining_credits
                ),
                Output::Json => println!("{}", serde_json::to_string_pretty(&receipt)?),
            }
        }
    }

    Ok(())
}
