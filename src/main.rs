//! # SVO Provider CLI (`svo`)
//!
//! The `svo` binary submits observation metadata of configured datasets to
//! the SVO catalog and helps writing the keyword definitions of new ones.
//!
//! ## Usage
//!
//! ```bash
//! svo --config ./svo.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `svo datasets` | List configured datasets and their source kind |
//! | `svo keywords <dataset>` | Print the keyword definitions of a dataset |
//! | `svo submit <dataset> [INPUT...]` | Extract and submit resources |
//! | `svo inspect fits <FILE...>` | Write keyword definitions from FITS headers |
//! | `svo inspect tap <URL>` | Write keyword definitions from a TAP table |
//!
//! ## Examples
//!
//! ```bash
//! # Show what would be submitted, without touching the catalog
//! svo submit swap 'data/2021/**/*.fits' --dry-run
//!
//! # Submit remote files
//! svo submit eit https://umbra.nascom.nasa.gov/eit/eit_lz/2021/06/efz20210601.000010
//!
//! # Submit TAP records modified since a date
//! svo submit lars --min-modif-time 2024-01-01
//!
//! # Inspect headers, resolving ambiguities interactively
//! svo inspect fits data/*.fits --backup inspect.json
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use svo_provider::config;
use svo_provider::convert::parse_date_time;
use svo_provider::datasets;
use svo_provider::fits::HduSelector;
use svo_provider::inspect::{self, FirstChoiceResolver, FitsInspector, InteractiveResolver, Resolver};
use svo_provider::models::KeywordSet;
use svo_provider::progress::ProgressMode;
use svo_provider::provider::{self, DatasetProfile, SubmitArgs, SubmitOptions};
use svo_provider::tap::TapClient;

/// SVO Provider CLI: extract observation metadata and submit it to the
/// SOLARNET Virtual Observatory.
///
/// Dataset commands read a TOML configuration file given by `--config`.
/// See `svo.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "svo",
    about = "Extract observation metadata from FITS headers and TAP records and submit it to the SVO",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./svo.toml")]
    config: PathBuf,

    /// Log level: error, warn, info, debug or trace. `RUST_LOG` overrides it.
    #[arg(long, global = true, default_value = "info")]
    verbose: String,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// List configured datasets.
    Datasets,

    /// Print the keyword definitions of a dataset.
    ///
    /// Uses the dataset's `keywords_file` when configured, the catalog
    /// otherwise. No credentials are needed.
    Keywords {
        /// Dataset config key or catalog name.
        dataset: String,
    },

    /// Extract resources from the inputs and submit them to the catalog.
    ///
    /// Inputs are glob patterns for `fits_file` datasets and URLs for
    /// `fits_url` datasets. TAP datasets read their records from the
    /// configured table and take no inputs.
    Submit {
        /// Dataset config key or catalog name.
        dataset: String,

        /// Files, glob patterns or URLs.
        inputs: Vec<String>,

        /// Print the resources as JSON instead of submitting them.
        #[arg(long)]
        dry_run: bool,

        /// Update the metadata of records that already exist.
        #[arg(long)]
        update: bool,

        /// Fail items with a missing or unconvertible optional field.
        #[arg(long)]
        strict: bool,

        /// Only process files or records modified after this date.
        #[arg(long = "min-modif-time", value_parser = parse_date_time)]
        min_modif_time: Option<chrono::NaiveDateTime>,

        /// TAP page size, defaults to the dataset's `page_size`.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Progress on stderr: off, human or json. Human when stderr is a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Write keyword definitions for a new dataset from sample data.
    Inspect {
        #[command(subcommand)]
        source: InspectSource,
    },
}

#[derive(Subcommand)]
enum InspectSource {
    /// Inspect the headers of FITS files or URLs.
    Fits {
        /// Files or http(s) URLs.
        #[arg(required = true)]
        inputs: Vec<String>,

        /// HDU index or EXTNAME.
        #[arg(long, default_value = "0")]
        hdu: HduSelector,

        #[arg(long, default_value = inspect::DEFAULT_FITS_OUTPUT)]
        output: PathBuf,

        /// Keywords to leave out, in addition to the defaults.
        #[arg(long)]
        exclude: Vec<String>,

        /// JSON file to save progress to and resume from.
        #[arg(long)]
        backup: Option<PathBuf>,

        /// Ask even when all samples agree.
        #[arg(long, conflicts_with = "non_interactive")]
        force_interactive: bool,

        /// Never ask, take the most common option.
        #[arg(long)]
        non_interactive: bool,
    },

    /// Inspect the columns of a TAP table.
    Tap {
        /// TAP service URL.
        url: String,

        /// Table to inspect; asked for when omitted.
        #[arg(long)]
        table: Option<String>,

        /// Defaults to `<table>_keywords_definition.json`.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Columns to leave out.
        #[arg(long)]
        exclude: Vec<String>,

        /// Never ask, take the first option.
        #[arg(long)]
        non_interactive: bool,
    },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn resolver(non_interactive: bool) -> Box<dyn Resolver> {
    if non_interactive || !atty::is(atty::Stream::Stdin) {
        Box::new(FirstChoiceResolver)
    } else {
        Box::new(InteractiveResolver::new(
            std::io::stdin().lock(),
            std::io::stdout(),
        ))
    }
}

async fn run_inspect(source: InspectSource) -> anyhow::Result<()> {
    let http = provider::http_client(30)?;
    match source {
        InspectSource::Fits {
            inputs,
            hdu,
            output,
            exclude,
            backup,
            force_interactive,
            non_interactive,
        } => {
            let mut inspector = FitsInspector::new(hdu, &exclude, backup, force_interactive);
            inspector.process(&inputs, &http).await?;
            let definitions = inspector.keyword_definitions(resolver(non_interactive).as_mut())?;
            inspect::write_definitions(&output, &definitions)
        }
        InspectSource::Tap {
            url,
            table,
            output,
            exclude,
            non_interactive,
        } => {
            let client = TapClient::new(http, &url)?;
            let mut resolver = resolver(non_interactive);
            let table = match table {
                Some(table) => table,
                None => inspect::select_table(&client, resolver.as_mut()).await?,
            };
            let definitions =
                inspect::inspect_tap(&client, &table, &exclude, resolver.as_mut()).await?;
            let output = output.unwrap_or_else(|| inspect::default_tap_output(&table));
            inspect::write_definitions(&output, &definitions)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.verbose);

    // Inspection works without a config file: the dataset does not exist yet.
    let command = match cli.command {
        Commands::Inspect { source } => return run_inspect(source).await,
        command => command,
    };

    let cfg = config::load_config(&cli.config)?;

    match command {
        Commands::Datasets => {
            datasets::list_datasets(&cfg)?;
        }
        Commands::Keywords { dataset } => {
            let dataset_config = cfg.dataset(&dataset)?;
            let profile = DatasetProfile::from_config(dataset_config)?;
            let http = provider::http_client(cfg.catalog.timeout_secs)?;
            let catalog = provider::rest_catalog(&cfg.catalog, http, false)?;
            let keywords = provider::fetch_keywords(&catalog, &profile)
                .await
                .with_context(|| format!("Could not get keywords of dataset \"{}\"", profile.name))?;
            datasets::print_keywords(&profile.name, &KeywordSet::new(keywords));
        }
        Commands::Submit {
            dataset,
            inputs,
            dry_run,
            update,
            strict,
            min_modif_time,
            batch_size,
            progress,
        } => {
            let args = SubmitArgs {
                inputs,
                options: SubmitOptions {
                    dry_run,
                    update_existing: update,
                    strict,
                },
                min_modification_time: min_modif_time,
                batch_size,
            };
            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
            provider::run_submit(&cfg, &dataset, args, progress.reporter().as_ref()).await?;
        }
        Commands::Inspect { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
