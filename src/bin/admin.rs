//! SnapDB - Admin tool
//!
//! Inspects and maintains a database directory:
//!
//! ```text
//! snapdb-admin <data_dir> tables
//! snapdb-admin <data_dir> schema <table>
//! snapdb-admin <data_dir> stats <table>
//! snapdb-admin <data_dir> verify
//! snapdb-admin <data_dir> vacuum
//! ```
//!
//! Engine settings are read from the JSON file named by `SNAPDB_CONFIG`
//! when it is set.

use anyhow::{bail, Context};
use std::env;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use snapdb::{Database, EngineConfig};

fn usage() -> &'static str {
    "usage: snapdb-admin <data_dir> tables|schema <table>|stats <table>|verify|vacuum"
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let (Some(dir), Some(command)) = (args.first(), args.get(1)) else {
        bail!(usage());
    };
    let dir = PathBuf::from(dir);
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }

    let config = match env::var_os("SNAPDB_CONFIG") {
        Some(path) => EngineConfig::from_file(&path)
            .with_context(|| format!("failed to read config {}", PathBuf::from(&path).display()))?,
        None => EngineConfig::new(),
    };
    let db = Database::open(config.data_dir(&dir))
        .with_context(|| format!("failed to open database at {}", dir.display()))?;

    match (command.as_str(), args.get(2)) {
        ("tables", None) => {
            for name in db.table_names() {
                let rows = db.analyze(&name)?.row_count;
                println!("{}\t{} rows", name, rows);
            }
        }
        ("schema", Some(table)) => {
            let info = db
                .catalog()
                .get_table_info(table)
                .with_context(|| format!("no schema for '{}'", table))?;
            println!("{}", info);
        }
        ("stats", Some(table)) => {
            let def = db.catalog().get_table(table)?;
            let stats = db.analyze(table)?;
            println!("{}: {} rows", table, stats.row_count);
            for (column, col_stats) in def.schema.columns().iter().zip(&stats.columns) {
                let bound = |v: &Option<snapdb::Value>| {
                    v.as_ref().map_or_else(|| "-".to_string(), |v| v.to_string())
                };
                println!(
                    "  {:<20} distinct={:<8} nulls={:<8} min={} max={}",
                    column.name,
                    col_stats.distinct,
                    col_stats.nulls,
                    bound(&col_stats.min),
                    bound(&col_stats.max)
                );
            }
        }
        ("verify", None) => {
            let reports = db.verify()?;
            let mut failures = 0;
            for report in &reports {
                let indexes: Vec<String> = report
                    .index_entries
                    .iter()
                    .map(|(name, entries)| format!("{}={}", name, entries))
                    .collect();
                println!(
                    "{}: pages={} versions={} successors={} rows={} indexes[{}]",
                    report.table,
                    report.pages,
                    report.versions,
                    report.successors,
                    report.rows,
                    indexes.join(", ")
                );
                for problem in &report.problems {
                    println!("  PROBLEM: {}", problem);
                }
                if !report.is_healthy() {
                    failures += 1;
                }
            }
            if failures > 0 {
                bail!("{} of {} tables failed verification", failures, reports.len());
            }
            println!("ok");
        }
        ("vacuum", None) => {
            let stats = db.vacuum()?;
            db.checkpoint().context("checkpoint after vacuum failed")?;
            println!(
                "vacuumed {} tables: {} versions removed, {} pages compacted",
                stats.tables, stats.versions_removed, stats.pages_compacted
            );
        }
        _ => bail!(usage()),
    }
    Ok(())
}
