//! # barograph
//!
//! Embedded storage engine for multi-channel environmental sensor readings.
//!
//! barograph keeps per-second readings of temperature, pressure, humidity,
//! wind speed and wind direction for any number of named sensors in a
//! single SQLite file. Each reading packs into 8 bytes. Minute and
//! ten-minute summaries (min, max, mean, sample standard deviation and
//! per-channel histograms) are maintained on every write, and a stored
//! range can be retroactively stretched, compressed or shifted when a
//! sensor's clock turns out to have been wrong.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Fixed-width packed readings with per-channel quantization
//! - Bounded-memory writes and reads: chunked transactions, paged queries
//! - Summaries rebuilt incrementally for the ten-minute periods a write touched
//! - Single writer, one connection per [`Store`], opened on first use
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use barograph::{PosixTime, Reading, ReadingValues, Store, StoreConfig};
//! use chrono::{DateTime, TimeDelta};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut store = Store::open(StoreConfig::new("./weather.db"))?;
//!
//! let mut values = ReadingValues::missing();
//! values.temperature = 18.4;
//! values.pressure = 101_325.0;
//! store.push_readings("roof", &[Reading::at(PosixTime::new(1_700_000_000), values)], true)?;
//!
//! // The roof sensor's clock ran 30 seconds slow over this hour.
//! let start = DateTime::from_timestamp(1_700_000_000, 0).ok_or("bad timestamp")?;
//! let (hour, lag) = (TimeDelta::hours(1), TimeDelta::seconds(30));
//! store.adjust_timestamps("roof", start..=start + hour, start + lag..=start + hour + lag, false)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`store`]: Caller-facing facade
//! - [`codec`]: Packed reading and histogram encoding
//! - [`record`]: Raw reading insert, paged range query, delete
//! - [`adjust`]: Range adjustment engine
//! - [`summary`]: Summary rebuild, query and resolution selection
//! - [`stats`]: Running per-channel statistics
//! - [`sensor`]: Sensor directory
//! - [`batch`]: Chunked transactional writer
//! - [`session`]: Lazily opened connection and schema
//! - [`config`]: Store configuration
//! - [`time`]: Epoch-second stamps and ranges
//! - [`error`]: Error types

pub mod adjust;
pub mod batch;
pub mod codec;
pub mod config;
pub mod error;
pub mod record;
pub mod sensor;
pub mod session;
pub mod stats;
pub mod store;
pub mod summary;
pub mod time;

// Re-export primary API types at crate root for convenience.
pub use adjust::{AdjustPlan, AdjustReport};
pub use codec::{Channel, Histogram, ReadingValues};
pub use config::StoreConfig;
pub use error::{BarographError, ErrorKind, InvalidOperation, Result};
pub use record::{PushReport, Reading, ReadingIter};
pub use sensor::{SensorId, SensorInfo};
pub use store::{Store, StoreInfo};
pub use summary::{Resolution, SummaryRecord, SummaryResult};
pub use time::{PosixTime, PosixTimeRange};
