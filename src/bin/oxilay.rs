// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use oxilay::{
    aggregate::Aggregator, config::Settings, context::FragmentContext,
    path::default_settings_path, System,
};

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use std::{fs::read_to_string, path::PathBuf, process::exit, sync::Arc};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  oxilay [options] <oxilay-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to settings file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let settings = load_settings(self.config)?;
        match self.command {
            Command::Merge(opts) => run_merge(settings, opts).await,
            Command::List(opts) => run_list(settings, opts),
            Command::Check(opts) => run_check(settings, opts).await,
            Command::Owners(opts) => run_owners(settings, opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Merge fragments of overlay directory, and print the result.
    #[command(override_usage = "oxilay merge [options] <overlay_dir>")]
    Merge(MergeOptions),

    /// List fragments of overlay directory.
    #[command(override_usage = "oxilay list [options] <overlay_dir>")]
    List(ListOptions),

    /// Check that no two fragments of overlay directory define the same key.
    #[command(override_usage = "oxilay check [options] <overlay_dir>")]
    Check(MergeOptions),

    /// Show which fragments define which keys.
    #[command(override_usage = "oxilay owners [options] <overlay_dir> [<key>]")]
    Owners(OwnersOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct MergeOptions {
    /// Overlay directory to scan for fragments.
    #[arg(required = true, value_name = "overlay_dir")]
    pub overlay_dir: PathBuf,

    /// Evaluate fragments concurrently.
    #[arg(long)]
    pub concurrent: bool,

    #[command(flatten)]
    pub context: ContextOptions,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ListOptions {
    /// Overlay directory to scan for fragments.
    #[arg(required = true, value_name = "overlay_dir")]
    pub overlay_dir: PathBuf,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct OwnersOptions {
    /// Overlay directory to scan for fragments.
    #[arg(required = true, value_name = "overlay_dir")]
    pub overlay_dir: PathBuf,

    /// Only show owners of this key.
    #[arg(value_name = "key")]
    pub key: Option<String>,

    #[command(flatten)]
    pub context: ContextOptions,
}

#[derive(Args, Clone, Debug)]
struct ContextOptions {
    /// Target system, e.g., "aarch64-darwin".
    #[arg(short, long, value_name = "system")]
    pub system: Option<System>,

    /// Host name to expose to fragments.
    #[arg(long, value_name = "hostname")]
    pub hostname: Option<String>,

    /// Location of external source input.
    #[arg(short, long, value_name = "name=location", value_parser = parse_assignment)]
    pub input: Vec<(String, String)>,

    /// Free-form binding to expose to fragments.
    #[arg(short, long, value_name = "name=value", value_parser = parse_assignment)]
    pub bind: Vec<(String, String)>,

    /// Treat references to unknown bindings as errors.
    #[arg(long)]
    pub strict: bool,
}

impl ContextOptions {
    /// Override settings with command line values.
    fn apply(self, settings: &mut Settings) {
        if let Some(system) = self.system {
            settings.context.system = Some(system);
        }

        if let Some(hostname) = self.hostname {
            settings.context.hostname = Some(hostname);
        }

        settings.context.inputs.extend(self.input);
        settings.context.bindings.extend(self.bind);
        settings.fragments.strict_bindings |= self.strict;
    }
}

fn parse_assignment(data: &str) -> Result<(String, String), String> {
    match data.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.into(), value.into())),
        _ => Err(format!("expected <name>=<value>, got {data:?}")),
    }
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time()
        .with_writer(std::io::stderr);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run() -> Result<()> {
    Cli::parse().run().await
}

fn load_settings(path: Option<PathBuf>) -> Result<Settings> {
    let path = match path {
        Some(path) => path,
        None => {
            let path = default_settings_path()?;
            if !path.is_file() {
                debug!("no settings file at {:?}, using defaults", path.display());
                return Ok(Settings::default());
            }
            path
        }
    };

    debug!("load settings from {:?}", path.display());
    Ok(read_to_string(&path)?.parse()?)
}

async fn aggregate(
    mut settings: Settings,
    opts: MergeOptions,
) -> Result<toml::Table> {
    opts.context.apply(&mut settings);
    let aggregator = Aggregator::with_evaluator(settings.layout()?, settings.evaluator());
    let context = settings.context();
    info!("aggregate {:?} for {}", opts.overlay_dir.display(), context.system());

    let result = if opts.concurrent {
        aggregator
            .aggregate_concurrent(&opts.overlay_dir, Arc::new(context))
            .await?
    } else {
        aggregator.aggregate(&opts.overlay_dir, &context)?
    };

    Ok(result)
}

async fn run_merge(settings: Settings, opts: MergeOptions) -> Result<()> {
    let result = aggregate(settings, opts).await?;
    print!("{}", toml::ser::to_string_pretty(&result)?);

    Ok(())
}

fn run_list(settings: Settings, opts: ListOptions) -> Result<()> {
    for fragment in settings.layout()?.discover(&opts.overlay_dir)? {
        println!("{fragment}");
    }

    Ok(())
}

async fn run_check(settings: Settings, opts: MergeOptions) -> Result<()> {
    let overlay_dir = opts.overlay_dir.clone();
    let result = aggregate(settings, opts).await?;
    info!(
        "no duplicate keys in {:?}, {} keys total",
        overlay_dir.display(),
        result.len()
    );

    Ok(())
}

fn run_owners(mut settings: Settings, opts: OwnersOptions) -> Result<()> {
    opts.context.apply(&mut settings);
    let aggregator = Aggregator::with_evaluator(settings.layout()?, settings.evaluator());
    let context: FragmentContext = settings.context();
    let index = aggregator.owners(&opts.overlay_dir, &context)?;

    if let Some(key) = opts.key {
        let owners = index
            .owners(&key)
            .ok_or_else(|| anyhow!("no fragment defines key {key:?}"))?;
        println!("{}", owners.join(", "));
        return Ok(());
    }

    let width = index.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    for (key, owners) in index.iter() {
        println!("{key:<width$}  {}", owners.join(", "));
    }

    Ok(())
}
