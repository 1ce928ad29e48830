//! Query engine of the Sysdig Monitor datasource.
//!
//! The panels of a dashboard query the datasource at the same time. Their queries are
//! batched by time window ([`batch`]), the window is aligned on what the backend can
//! serve ([`time_window`]), each target is turned into an aggregation request
//! ([`query::request`]) and the responses are split back into series ([`reshape`]).
//!
//! # Example
//!
//! ```no_run
//! use sysdig_datasource::{Datasource, DatasourceConfig, datasource::{QueryOptions, Range, PanelTarget}};
//!
//! # async fn run() -> Result<(), sysdig_datasource::DatasourceError> {
//! let config = DatasourceConfig {
//!     api_token: String::from("my-token"),
//!     ..Default::default()
//! };
//! let datasource = Datasource::new(&config)?;
//! let result = datasource
//!     .query(QueryOptions {
//!         range: Some(Range { from: 1_500_000_000_000, to: 1_500_003_600_000 }),
//!         interval_ms: Some(60_000),
//!         targets: vec![PanelTarget {
//!             target: Some(String::from("cpu.used.percent")),
//!             ..Default::default()
//!         }],
//!     })
//!     .await?;
//! for series in result.series() {
//!     println!("{}: {} points", series.target, series.datapoints.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod alias;
pub mod api;
pub mod batch;
pub mod cache;
pub mod config;
pub mod datasource;
pub mod error;
pub mod metrics;
pub mod query;
pub mod reshape;
pub mod time_window;

pub use config::DatasourceConfig;
pub use datasource::Datasource;
pub use error::DatasourceError;
