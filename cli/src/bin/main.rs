use std::{
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use clap::Parser;
use sysdig_datasource::{
    Datasource, DatasourceConfig,
    datasource::{PanelTarget, QueryOptions, Range},
    metrics::MetricsQuery,
    query::SortDirection,
};
use sysdig_datasource_cli::{apply_overrides, init_logger, load_config, regen_config};

use cli::{Cli, Command, ConfigCommand, QueryArgs};

/// Runs the command given on the command line.
///
/// About errors: we use `anyhow::Result` and `context` instead of `expect` to get
/// nicer error messages.
fn main() -> anyhow::Result<()> {
    init_logger();
    let args = Cli::parse();

    // commands that don't need a valid config
    if let Command::Config {
        command: ConfigCommand::Regen,
    } = &args.command
    {
        let path = Path::new(&args.config);
        regen_config(path)?;
        log::info!("Default configuration file written to: {}", path.display());
        return Ok(());
    }

    let mut config = load_config(Path::new(&args.config), !args.no_default_config).context("could not load config")?;
    apply_overrides(&mut config, args.url, args.token);
    if config.api_token.is_empty() {
        log::warn!("No API token configured, the backend will reject the requests.");
    }

    // One thread is enough, and it makes the panels of a run share their batches.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("could not start the tokio runtime")?;
    rt.block_on(run_command(args.command, config))
}

async fn run_command(command: Command, config: DatasourceConfig) -> anyhow::Result<()> {
    let datasource = Datasource::new(&config).context("could not create the datasource")?;
    match command {
        Command::Test => {
            let result = datasource
                .test_datasource()
                .await
                .with_context(|| format!("could not connect to {}", config.url))?;
            println!("{}: {}", result.title, result.message);
        }
        Command::Query(args) => {
            let options = query_options(args, now_ms()?)?;
            let result = datasource.query(options).await.context("query failed")?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Metrics { matching } => {
            let query = matching.map(MetricsQuery::matching).unwrap_or_default();
            let metrics = datasource.find_metrics(&query).await.context("could not list the metrics")?;
            for m in metrics {
                println!("{}", m.id);
            }
        }
        Command::Labels { metric } => {
            let labels = datasource
                .find_segment_by(metric.as_deref())
                .await
                .context("could not list the labels")?;
            for l in labels {
                println!("{}", l.id);
            }
        }
        Command::Config { .. } => unreachable!("config commands are run before the config is loaded"),
    }
    Ok(())
}

fn now_ms() -> anyhow::Result<i64> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
    Ok(now.as_millis() as i64)
}

/// Builds the panel request of the `query` command.
fn query_options(args: QueryArgs, now_ms: i64) -> anyhow::Result<QueryOptions> {
    let to = args.to.map(|s| s * 1000).unwrap_or(now_ms);
    let from = match args.from {
        Some(s) => s * 1000,
        None => to - args.last.as_millis() as i64,
    };
    if from >= to {
        anyhow::bail!("the start of the time range must be before its end");
    }

    let target = PanelTarget {
        target: Some(args.metric),
        time_aggregation: args.time_aggregation,
        group_aggregation: args.group_aggregation,
        segment_by: args.segment_by,
        filter: args.filter,
        sort_direction: Some(args.order.into()),
        page_limit: args.limit,
        alias: args.alias,
        is_single_data_point: args.single,
        is_tabular_format: args.table,
        hide: false,
    };
    Ok(QueryOptions {
        range: Some(Range { from, to }),
        interval_ms: args.sampling.map(|d| d.as_millis() as i64),
        targets: vec![target],
    })
}

impl From<cli::Order> for SortDirection {
    fn from(order: cli::Order) -> Self {
        match order {
            cli::Order::Asc => SortDirection::Asc,
            cli::Order::Desc => SortDirection::Desc,
        }
    }
}

mod cli {
    use std::time::Duration;

    use clap::{Args, Parser, Subcommand, ValueEnum};

    /// Query a Sysdig Monitor backend like the Grafana datasource does.
    #[derive(Parser)]
    #[command(version)]
    pub struct Cli {
        #[command(subcommand)]
        pub command: Command,

        /// Path to the config file.
        #[arg(long, env = "SYSDIG_DATASOURCE_CONFIG", default_value = "sysdig-datasource.toml")]
        pub config: String,

        /// If set, the config file must exist, otherwise the command fails.
        #[arg(long, default_value_t = false)]
        pub no_default_config: bool,

        /// Base url of the API, overrides the config file.
        #[arg(long, global = true)]
        pub url: Option<String>,

        /// API token, overrides the config file.
        #[arg(long, env = "SYSDIG_API_TOKEN", hide_env_values = true, global = true)]
        pub token: Option<String>,
    }

    #[derive(Subcommand)]
    pub enum Command {
        /// Check that the backend accepts the token.
        Test,

        /// Query a metric and print the result as JSON.
        Query(QueryArgs),

        /// List the metrics.
        Metrics {
            /// Only list the metrics that match this text.
            #[arg(long = "match")]
            matching: Option<String>,
        },

        /// List the labels that a metric can be segmented by.
        Labels {
            /// The metric, all the labels if not set.
            metric: Option<String>,
        },

        /// Manipulate the configuration.
        Config {
            #[command(subcommand)]
            command: ConfigCommand,
        },
    }

    #[derive(Subcommand)]
    pub enum ConfigCommand {
        /// Regenerate the configuration file and stop.
        ///
        /// If the file exists, it will be overwritten.
        Regen,
    }

    #[derive(Args)]
    pub struct QueryArgs {
        /// Id of the metric, ex. `cpu.used.percent`.
        pub metric: String,

        /// Start of the time range, in seconds since the epoch.
        #[arg(long)]
        pub from: Option<i64>,

        /// End of the time range, in seconds since the epoch. Defaults to now.
        #[arg(long)]
        pub to: Option<i64>,

        /// Length of the time range when `--from` is not set.
        #[arg(long, default_value = "1h", value_parser = humantime::parse_duration)]
        pub last: Duration,

        /// Width of the time buckets, ex. `1m`.
        #[arg(long, value_parser = humantime::parse_duration)]
        pub sampling: Option<Duration>,

        /// Labels to segment by, separated by commas.
        #[arg(long, value_delimiter = ',')]
        pub segment_by: Vec<String>,

        /// Scope expression, ex. `host.hostName = 'web-1'`.
        #[arg(long)]
        pub filter: Option<String>,

        #[arg(long)]
        pub time_aggregation: Option<String>,

        #[arg(long)]
        pub group_aggregation: Option<String>,

        /// Maximum number of segments.
        #[arg(long)]
        pub limit: Option<i64>,

        #[arg(long, value_enum, default_value_t = Order::Desc)]
        pub order: Order,

        /// Name of the series, ex. `{{metric}} on {{host.hostName}}`.
        #[arg(long)]
        pub alias: Option<String>,

        /// Return one value per segment instead of a time series.
        #[arg(long, default_value_t = false)]
        pub single: bool,

        /// Return a table.
        #[arg(long, default_value_t = false)]
        pub table: bool,
    }

    #[derive(Clone, Copy, ValueEnum)]
    pub enum Order {
        Asc,
        Desc,
    }
}
