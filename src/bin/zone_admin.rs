//! zone_admin - CLI for zone definitions and the count log

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use zone_occupancy::{
    polygon_from_pairs,
    stats::{self, CountQuery},
    zones::{import_zones, load_seed_file},
    Point, RecordStore, SqliteStore, Zone, ZoneKey, ZoneRegistry,
};

#[derive(Parser, Debug)]
#[command(name = "zone_admin", about = "Manage occupancy zones and inspect counts")]
struct Args {
    #[arg(long, env = "OCCUPANCY_DB_PATH", default_value = "occupancy.db")]
    db: String,

    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Seed zones from a JSON or TOML definition file (existing ones are skipped)
    Import { file: PathBuf },

    /// Create a zone
    Set {
        #[arg(long)]
        location: String,
        #[arg(long)]
        area: String,
        /// JSON list of [x, y] pairs, e.g. '[[0,0],[10,0],[10,10]]'
        #[arg(long)]
        polygon: String,
    },

    /// Replace the polygon of an existing zone
    Update {
        #[arg(long)]
        location: String,
        #[arg(long)]
        area: String,
        #[arg(long)]
        polygon: String,
    },

    Delete {
        #[arg(long)]
        location: String,
        #[arg(long)]
        area: String,
    },

    Get {
        #[arg(long)]
        location: String,
        #[arg(long)]
        area: String,
    },

    /// List zones, optionally for one location
    List {
        #[arg(long)]
        location: Option<String>,
    },

    /// Page through count records, newest first
    Counts {
        /// Epoch seconds, inclusive
        #[arg(long)]
        start: Option<i64>,
        #[arg(long)]
        end: Option<i64>,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },

    /// Most recent count record
    Live,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let store = SqliteStore::open(&args.db, Duration::from_millis(args.timeout_ms))?;
    let mut registry = ZoneRegistry::new(store);

    match args.command {
        Command::Import { file } => {
            let zones = load_seed_file(&file)?;
            let report = import_zones(&mut registry, zones)?;
            println!(
                "imported {} zone(s), skipped {} existing",
                report.created.len(),
                report.skipped.len()
            );
            for key in &report.skipped {
                println!("  skipped {}", key);
            }
        }
        Command::Set {
            location,
            area,
            polygon,
        } => {
            let zone = registry.set(Zone::new(&location, &area, parse_polygon(&polygon)?)?)?;
            print_json(&zone)?;
        }
        Command::Update {
            location,
            area,
            polygon,
        } => {
            let zone = registry.update(&ZoneKey::new(&location, &area), parse_polygon(&polygon)?)?;
            print_json(&zone)?;
        }
        Command::Delete { location, area } => {
            let key = ZoneKey::new(&location, &area);
            registry.delete(&key)?;
            println!("deleted {}", key);
        }
        Command::Get { location, area } => {
            print_json(&registry.get(&ZoneKey::new(&location, &area))?)?;
        }
        Command::List { location } => {
            print_json(&registry.list(location.as_deref())?)?;
        }
        Command::Counts {
            start,
            end,
            page,
            limit,
        } => {
            let query = CountQuery {
                start_epoch_s: start,
                end_epoch_s: end,
                page,
                limit,
            };
            print_json(&stats::query_counts(registry.store_mut(), &query)?)?;
        }
        Command::Live => {
            let people = registry.store_mut().count_people()?;
            match stats::latest_count(registry.store_mut())? {
                Some(latest) => print_json(&latest)?,
                None => println!("no count records yet ({} person records)", people),
            }
        }
    }
    Ok(())
}

fn parse_polygon(raw: &str) -> Result<Vec<Point>> {
    let pairs: Vec<[i32; 2]> = serde_json::from_str(raw)
        .map_err(|e| anyhow!("polygon must be a JSON list of [x, y] pairs: {}", e))?;
    Ok(polygon_from_pairs(&pairs))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
