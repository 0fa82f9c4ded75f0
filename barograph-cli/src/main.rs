//! CLI for the barograph sensor storage engine.
//!
//! Provides commands for importing, querying, correcting and inspecting
//! barograph stores.

use std::io::{self, Write};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use barograph::{
    Channel, Reading, ReadingIter, ReadingValues, Resolution, Store, StoreConfig, SummaryRecord,
};
use chrono::{DateTime, TimeDelta, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// barograph: embedded storage engine for environmental sensor readings.
#[derive(Parser)]
#[command(name = "barograph", version, about)]
struct Cli {
    /// Path to the database file.
    #[arg(long, global = true, default_value = "barograph.db")]
    db: PathBuf,

    /// JSON store configuration; its path takes precedence over --db.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log more (-v info, -vv debug). `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Display row counts and configuration.
    Info,

    /// List registered sensors.
    Sensors {
        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Import readings from a CSV file.
    ///
    /// Columns: timestamp,temperature,pressure,humidity,wind_speed,wind_direction.
    /// Timestamps are epoch seconds or RFC 3339; empty fields are missing.
    Import {
        /// Sensor to import into; created if missing.
        sensor: String,

        /// CSV file to read.
        csv: PathBuf,

        /// Overwrite readings already stored at the same timestamp.
        #[arg(long)]
        replace: bool,

        /// Hardware id the readings were loaded from.
        #[arg(long)]
        hardware_id: Option<String>,
    },

    /// Print raw readings.
    Query {
        /// Sensor to query.
        sensor: String,

        /// Start time (epoch seconds or RFC 3339). Defaults to now minus span.
        #[arg(long)]
        from: Option<String>,

        /// Span to read (e.g. "1h", "30m", "-7d"); negative reads backwards.
        #[arg(long, default_value = "1h", allow_hyphen_values = true)]
        span: String,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Print summary statistics.
    Summaries {
        /// Sensor to query.
        sensor: String,

        /// Start time (epoch seconds or RFC 3339). Defaults to now minus span.
        #[arg(long)]
        from: Option<String>,

        /// Span to read (e.g. "1d").
        #[arg(long, default_value = "1d", allow_hyphen_values = true)]
        span: String,

        /// Resolution; picked from the span when omitted.
        #[arg(long)]
        resolution: Option<ResolutionArg>,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Move readings recorded over one range so they cover another.
    Adjust {
        /// Sensor to correct.
        sensor: String,

        /// Start of the range as recorded.
        #[arg(long)]
        from: String,

        /// End of the range as recorded.
        #[arg(long)]
        to: String,

        /// Start of the corrected range.
        #[arg(long)]
        new_from: String,

        /// End of the corrected range.
        #[arg(long)]
        new_to: String,

        /// Allow replacing readings outside the recorded range.
        #[arg(long)]
        overwrite: bool,
    },

    /// Rename a sensor.
    Rename {
        /// Current name.
        old: String,
        /// New name.
        new: String,
    },

    /// Delete a sensor with all of its readings.
    Delete {
        /// Sensor to delete.
        sensor: String,
    },

    /// Show the latest sync stamp, or record a new one.
    SyncStamp {
        /// Time to record (epoch seconds, RFC 3339 or "now").
        #[arg(long)]
        set: Option<String>,
    },
}

/// Output format for query results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON document.
    Json,
}

/// Summary resolution.
#[derive(Clone, Copy, ValueEnum)]
enum ResolutionArg {
    Minute,
    TenMinutes,
    Hour,
    Day,
}

impl From<ResolutionArg> for Resolution {
    fn from(value: ResolutionArg) -> Self {
        match value {
            ResolutionArg::Minute => Self::Minute,
            ResolutionArg::TenMinutes => Self::TenMinutes,
            ResolutionArg::Hour => Self::Hour,
            ResolutionArg::Day => Self::Day,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = open_store(&cli.db, cli.config.as_deref()).and_then(|mut store| {
        run(&mut store, cli.command)?;
        store.close()?;
        Ok(())
    });

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn open_store(db: &Path, config: Option<&Path>) -> Result<Store, Box<dyn std::error::Error>> {
    let config = match config {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::new(db),
    };
    tracing::debug!(path = %config.path.display(), "opening store");
    Ok(Store::open(config)?)
}

fn run(store: &mut Store, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Info => cmd_info(store),
        Commands::Sensors { format } => cmd_sensors(store, &format),
        Commands::Import {
            sensor,
            csv,
            replace,
            hardware_id,
        } => cmd_import(store, &sensor, &csv, replace, hardware_id.as_deref()),
        Commands::Query {
            sensor,
            from,
            span,
            format,
        } => cmd_query(store, &sensor, from.as_deref(), &span, &format),
        Commands::Summaries {
            sensor,
            from,
            span,
            resolution,
            format,
        } => cmd_summaries(store, &sensor, from.as_deref(), &span, resolution, &format),
        Commands::Adjust {
            sensor,
            from,
            to,
            new_from,
            new_to,
            overwrite,
        } => {
            let current = parse_time(&from)?..=parse_time(&to)?;
            let corrected = parse_time(&new_from)?..=parse_time(&new_to)?;
            cmd_adjust(store, &sensor, current, corrected, overwrite)
        }
        Commands::Rename { old, new } => {
            if !store.rename_sensor(&old, &new)? {
                return Err(format!("Cannot rename '{old}' to '{new}'").into());
            }
            println!("Renamed '{old}' to '{new}'");
            Ok(())
        }
        Commands::Delete { sensor } => {
            if !store.delete_sensor(&sensor)? {
                return Err(format!("Sensor '{sensor}' not found").into());
            }
            println!("Deleted '{sensor}'");
            Ok(())
        }
        Commands::SyncStamp { set } => cmd_sync_stamp(store, set.as_deref()),
    }
}

/// Implements `barograph info`.
fn cmd_info(store: &mut Store) -> Result<(), Box<dyn std::error::Error>> {
    let info = store.info()?;
    let config = store.config();
    println!("Store: {}", config.path.display());
    println!("  Journal: {}", config.journal_mode.pragma_value());
    println!("  Batch size: {}", config.batch_size);
    println!();
    println!("Sensors: {}", info.sensors);
    println!("Readings: {}", info.records);
    println!("Minute summaries: {}", info.minute_records);
    println!("Ten-minute summaries: {}", info.ten_minute_records);
    println!("Sync stamps: {}", info.sync_stamps);

    let spans: Vec<String> = store
        .supported_summary_spans()
        .iter()
        .map(|r| match r.table() {
            Some(_) => r.to_string(),
            None => format!("{r} (unsupported)"),
        })
        .collect();
    println!("Summary resolutions: {}", spans.join(", "));
    Ok(())
}

/// Implements `barograph sensors`.
fn cmd_sensors(store: &mut Store, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let sensors = store.get_all_sensors()?;
    match format {
        OutputFormat::Csv => {
            println!("id,name,last_hardware_id");
            for s in &sensors {
                println!("{},{},{}", s.id.get(), s.name, s.last_hardware_id);
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&sensors)?),
    }
    Ok(())
}

/// Implements `barograph import <sensor> <csv>`.
fn cmd_import(
    store: &mut Store,
    sensor: &str,
    csv: &Path,
    replace: bool,
    hardware_id: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(csv)?;
    let mut readings = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("timestamp") {
            continue;
        }
        let reading =
            parse_reading(line).map_err(|e| format!("{}:{}: {e}", csv.display(), line_no + 1))?;
        readings.push(reading);
    }

    let report = store.push_readings(sensor, &readings, replace)?;
    if let Some(hw) = hardware_id {
        store.set_latest_name_for_hardware_id(sensor, hw)?;
    }
    println!(
        "Imported {} readings into '{sensor}' ({} chunks)",
        report.batch.rows, report.batch.chunks_committed
    );
    if let Some(range) = report.range {
        println!("  Range: {} .. {}", range.low.to_datetime(), range.high.to_datetime());
    }
    Ok(())
}

/// Implements `barograph query <sensor>`.
fn cmd_query(
    store: &mut Store,
    sensor: &str,
    from: Option<&str>,
    span: &str,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let span = parse_span(span)?;
    let from = match from {
        Some(s) => parse_time(s)?,
        None => Utc::now() - span.abs(),
    };

    let readings = store.query_readings(sensor, from, span)?;
    let mut out = io::stdout().lock();
    let count = match format {
        OutputFormat::Csv => write_readings_csv(&mut out, sensor, readings)?,
        OutputFormat::Json => write_readings_json(&mut out, sensor, readings)?,
    };
    out.flush()?;
    tracing::debug!(sensor, count, "query written");
    Ok(())
}

/// Writes readings as CSV rows as they are paged in. Returns the row count.
fn write_readings_csv(
    out: &mut impl Write,
    sensor: &str,
    readings: ReadingIter<'_>,
) -> Result<usize, Box<dyn std::error::Error>> {
    writeln!(out, "# sensor={sensor}")?;
    writeln!(out, "timestamp,{}", channel_header(""))?;
    let mut count = 0;
    for reading in readings {
        let r = reading?;
        writeln!(out, "{},{}", r.timestamp().to_rfc3339(), csv_values(&r.values))?;
        count += 1;
    }
    writeln!(out, "# readings={count}")?;
    Ok(count)
}

/// Writes `{"sensor": .., "data": [..], "count": ..}` one reading at a time.
fn write_readings_json(
    out: &mut impl Write,
    sensor: &str,
    readings: ReadingIter<'_>,
) -> Result<usize, Box<dyn std::error::Error>> {
    write!(out, "{{\"sensor\":{},\"data\":[", serde_json::to_string(sensor)?)?;
    let mut count = 0;
    for reading in readings {
        let r = reading?;
        if count > 0 {
            write!(out, ",")?;
        }
        let row = serde_json::json!({
            "timestamp": r.timestamp().to_rfc3339(),
            "values": r.values,
        });
        serde_json::to_writer(&mut *out, &row)?;
        count += 1;
    }
    writeln!(out, "],\"count\":{count}}}")?;
    Ok(count)
}

/// Implements `barograph summaries <sensor>`.
fn cmd_summaries(
    store: &mut Store,
    sensor: &str,
    from: Option<&str>,
    span: &str,
    resolution: Option<ResolutionArg>,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let span = parse_span(span)?;
    let from = match from {
        Some(s) => parse_time(s)?,
        None => Utc::now() - span.abs(),
    };

    let result = match resolution {
        Some(r) => store.query_summaries_at(sensor, from, span, r.into())?,
        // Aim for roughly a hundred rows.
        None => store.query_summaries(sensor, from, span, span.abs() / 100)?,
    };

    match format {
        OutputFormat::Csv => {
            println!(
                "# sensor={sensor}, resolution={}, rows={}",
                result.resolution(),
                result.len()
            );
            let header: Vec<String> = ["min", "max", "mean", "stddev"]
                .iter()
                .map(|stat| channel_header(&format!("{stat}_")))
                .collect();
            println!("timestamp,records,{}", header.join(","));
            for s in result.records() {
                println!("{}", csv_summary(s));
            }
        }
        OutputFormat::Json => {
            let output = serde_json::json!({
                "sensor": sensor,
                "resolution": result.resolution().to_string(),
                "count": result.len(),
                "data": result.records(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Implements `barograph adjust <sensor>`.
fn cmd_adjust(
    store: &mut Store,
    sensor: &str,
    current: RangeInclusive<DateTime<Utc>>,
    corrected: RangeInclusive<DateTime<Utc>>,
    overwrite: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let shown = |r: &RangeInclusive<DateTime<Utc>>| {
        format!("{} .. {}", r.start().to_rfc3339(), r.end().to_rfc3339())
    };
    println!("Adjusting '{sensor}': {} -> {}", shown(&current), shown(&corrected));
    let report = store.adjust_timestamps(sensor, current, corrected, overwrite)?;
    println!("  Moved: {}", report.moved);
    println!("  Removed: {}", report.removed);
    for window in &report.rebuilt {
        println!(
            "  Rebuilt {} .. {}: {} minute, {} ten-minute summaries",
            window.low,
            window.high_exclusive,
            window.minute.rows,
            window.ten_minute.rows
        );
    }
    Ok(())
}

/// Implements `barograph sync-stamp`.
fn cmd_sync_stamp(store: &mut Store, set: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(s) = set {
        let stamp = if s == "now" { Utc::now() } else { parse_time(s)? };
        store.push_sync_stamp(stamp)?;
    }
    match store.get_max_sync_stamp()? {
        Some(stamp) => println!("{}", stamp.to_rfc3339()),
        None => println!("never synced"),
    }
    Ok(())
}

/// Parses epoch seconds or an RFC 3339 timestamp.
fn parse_time(s: &str) -> Result<DateTime<Utc>, Box<dyn std::error::Error>> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| format!("Timestamp out of range: {secs}").into());
    }
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

/// Parses a signed human-readable span (e.g. "1h", "-30m", "7d").
fn parse_span(s: &str) -> Result<TimeDelta, Box<dyn std::error::Error>> {
    let s = s.trim();
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if s.is_empty() {
        return Err("Empty duration string".into());
    }

    let unit_at = s.char_indices().last().map_or(0, |(i, _)| i);
    let (num_str, unit) = s.split_at(unit_at);
    let num: i64 = num_str.parse()?;
    let span = match unit {
        "s" => TimeDelta::try_seconds(num),
        "m" => TimeDelta::try_minutes(num),
        "h" => TimeDelta::try_hours(num),
        "d" => TimeDelta::try_days(num),
        _ => return Err(format!("Unknown duration unit: '{unit}'. Use s, m, h, or d.").into()),
    }
    .ok_or("Duration out of range")?;

    Ok(if negative { -span } else { span })
}

/// Parses one CSV line into a reading.
fn parse_reading(line: &str) -> Result<Reading, Box<dyn std::error::Error>> {
    let mut fields = line.split(',').map(str::trim);
    let stamp = parse_time(fields.next().ok_or("missing timestamp")?)?;

    let mut values = ReadingValues::missing();
    for channel in Channel::ALL {
        match fields.next() {
            Some("") | None => {}
            Some(field) => values.set(channel, field.parse()?),
        }
    }
    if fields.next().is_some() {
        return Err("too many columns".into());
    }
    Ok(Reading::new(stamp, values)?)
}

fn channel_header(prefix: &str) -> String {
    Channel::ALL
        .iter()
        .map(|c| format!("{prefix}{c}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Formats channel values; missing values are empty.
fn csv_values(values: &ReadingValues) -> String {
    Channel::ALL
        .iter()
        .map(|&c| {
            let v = values.get(c);
            if v.is_nan() { String::new() } else { v.to_string() }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn csv_summary(s: &SummaryRecord) -> String {
    format!(
        "{},{},{},{},{},{}",
        s.timestamp().to_rfc3339(),
        s.record_count,
        csv_values(&s.min),
        csv_values(&s.max),
        csv_values(&s.mean),
        csv_values(&s.stddev)
    )
}
