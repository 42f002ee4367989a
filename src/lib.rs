pub mod builder;
pub mod cache;
pub mod cli;
pub mod coerce;
pub mod config;
pub mod data;
pub mod defaults;
pub mod error;
pub mod graph;
pub mod hooks;
pub mod io_utils;
pub mod mapping;
pub mod migrator;
pub mod model;
pub mod persist;
pub mod rows;
pub mod table;

use std::{env, fs::File, io::BufWriter, sync::OnceLock};

use anyhow::{Context, Result};
use clap::Parser;
use itertools::Itertools;
use log::{LevelFilter, debug, info};

use crate::{
    cli::{Cli, Commands},
    coerce::Coercer,
    config::{MigrationConfig, SchemaProvider},
    io_utils::printable_delimiter,
    migrator::{CsvRejectSink, DiscardRejects, MigrationContext, MigrationOptions},
    model::Model,
    persist::JsonLinesGateway,
    rows::RowSource,
    table::{Align, Table},
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("graph_migrate", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Migrate(args) => handle_migrate(&args),
        Commands::Plan(args) => handle_plan(&args),
    }
}

fn load_inputs(
    model: &std::path::Path,
    config: &std::path::Path,
) -> Result<(Model, MigrationConfig)> {
    let model = Model::load(model).with_context(|| format!("Loading model from {model:?}"))?;
    let config = MigrationConfig::load(config)
        .with_context(|| format!("Loading migration config from {config:?}"))?;
    Ok((model, config))
}

fn handle_migrate(args: &cli::MigrateArgs) -> Result<()> {
    let delimiter = io_utils::resolve_input_delimiter(&args.input, args.delimiter);
    let encoding = io_utils::resolve_encoding(args.input_encoding.as_deref())?;
    info!(
        "Migrating '{}' with delimiter '{}'",
        args.input.display(),
        printable_delimiter(delimiter)
    );
    let (model, config) = load_inputs(&args.model, &args.config)?;
    let source = RowSource::from_path(&args.input, delimiter, encoding)
        .with_context(|| format!("Reading input {:?}", args.input))?;
    let headers = source.headers().to_vec();
    debug!("Input headers: {headers:?}");

    let output = io_utils::open_output(args.output.as_deref())?;
    let mut context = MigrationContext::new(model, &config, headers, JsonLinesGateway::new(output))
        .with_context(|| format!("Compiling mapping from {:?}", args.config))?;
    let options = MigrationOptions {
        dry_run: args.dry_run || config.options.dry_run,
        unique: args.unique || config.options.unique,
        limit: args.limit,
        stop: None,
    };
    if options.dry_run {
        info!("Dry run: nothing will be persisted");
    }

    let report = match &args.rejects {
        Some(path) => {
            let file =
                File::create(path).with_context(|| format!("Creating rejects file {path:?}"))?;
            let mut sink = CsvRejectSink::new(BufWriter::new(file), delimiter);
            context.run(source, &options, &mut sink)?
        }
        None => context.run(source, &options, &mut DiscardRejects)?,
    };
    context.gateway_mut().flush().context("Flushing output")?;

    let mut table = Table::new(["metric", "count"]).align(1, Align::Right);
    table.extend(report.summary_rows());
    eprint!("{table}");
    Ok(())
}

fn handle_plan(args: &cli::PlanArgs) -> Result<()> {
    let (model, config) = load_inputs(&args.model, &args.config)?;
    let headers = match &args.input {
        Some(path) => {
            let delimiter = io_utils::resolve_input_delimiter(path, args.delimiter);
            let encoding = io_utils::resolve_encoding(args.input_encoding.as_deref())?;
            RowSource::from_path(path, delimiter, encoding)
                .with_context(|| format!("Reading headers from {path:?}"))?
                .headers()
                .to_vec()
        }
        None => configured_columns(&config),
    };
    let (plan, resolver) = config
        .compile(&headers, &model, &Coercer::default())
        .with_context(|| format!("Compiling mapping from {:?}", args.config))?;

    let mut table = Table::new(["#", "column", "path", "target", "convert", "default"])
        .align(0, Align::Right);
    table.extend(plan.describe());
    print!("{table}");
    info!(
        "{} column(s) map onto {} entr{} rooted at {}; {} default rule(s)",
        plan.columns.len(),
        plan.entries.len(),
        if plan.entries.len() == 1 { "y" } else { "ies" },
        plan.root_class(),
        resolver.rule_count()
    );
    Ok(())
}

/// Every column the config names, for planning without an input file.
fn configured_columns(config: &MigrationConfig) -> Vec<String> {
    let mapping = config.mapping();
    mapping
        .columns
        .iter()
        .flat_map(|c| std::iter::once(c.column.clone()).chain(c.default_from.clone()))
        .chain(mapping.scope.clone())
        .unique()
        .collect()
}
