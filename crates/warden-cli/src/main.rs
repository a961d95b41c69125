//! warden - inspect reliability configs and state-machine definitions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::debug;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use warden_core::{FsmDefinition, ResourceSettings, WardenConfig};
use warden_runtime::resilience::backoff;
use warden_runtime::{FsmBuilder, InMemoryStateStore, StateStore};

/// warden - reliability pipeline and state-machine tooling
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a reliability config (YAML or JSON)
    Check {
        /// Config file
        config: PathBuf,
    },

    /// Print effective per-resource settings
    Resolve {
        /// Config file
        config: PathBuf,

        /// Only this resource (unconfigured names get the defaults)
        resource: Option<String>,

        #[arg(short, long, value_enum, default_value = "yaml")]
        format: Format,
    },

    /// Print the retry delay schedule for a resource
    Backoff {
        /// Config file; built-in defaults when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Resource whose retry policy to use
        #[arg(short, long, default_value = "default")]
        resource: String,

        /// Number of attempts to show
        #[arg(short = 'n', long, default_value = "8")]
        attempts: u32,
    },

    /// Replay a path of states against an FSM definition
    Walk {
        /// Definition file (YAML or JSON)
        definition: PathBuf,

        /// States to move through, in order
        #[arg(required = true)]
        states: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Yaml,
    Json,
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

fn load_config(path: &Path) -> Result<WardenConfig> {
    let config = WardenConfig::from_file(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    debug!(path = %path.display(), resources = config.resources.len(), "Loaded config");
    Ok(config)
}

fn check(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    println!(
        "{}: ok ({} resources, workflow budget {} iterations)",
        path.display(),
        config.resources.len(),
        config.workflow.budget.max_iterations
    );
    Ok(())
}

fn resolve(path: &Path, resource: Option<&str>, format: Format) -> Result<()> {
    let config = load_config(path)?;

    let view: BTreeMap<String, ResourceSettings> = match resource {
        Some(name) => BTreeMap::from([(name.to_string(), config.resolve(name))]),
        None => std::iter::once(("defaults".to_string(), config.resolve_defaults()))
            .chain(
                config
                    .resource_names()
                    .into_iter()
                    .map(|name| (name.to_string(), config.resolve(name))),
            )
            .collect(),
    };

    let rendered = match format {
        Format::Yaml => serde_yaml::to_string(&view)?,
        Format::Json => serde_json::to_string_pretty(&view)?,
    };
    println!("{}", rendered.trim_end());
    Ok(())
}

fn print_backoff(config: Option<&Path>, resource: &str, attempts: u32) -> Result<()> {
    let config = match config {
        Some(path) => load_config(path)?,
        None => WardenConfig::default(),
    };
    let retry = config.resolve(resource).retry;
    let strategy = backoff::from_config(&retry.backoff);

    println!("{} (max_attempts = {})", resource, retry.max_attempts);
    for attempt in 0..attempts {
        let marker = if attempt + 1 >= retry.max_attempts { "  (not reached)" } else { "" };
        println!(
            "  after attempt {:>2}: {:>6} ms{}",
            attempt + 1,
            strategy.base_delay(attempt).as_millis(),
            marker
        );
    }
    Ok(())
}

async fn walk(path: &Path, states: &[String]) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let is_json = path.extension().is_some_and(|ext| ext == "json");
    let definition = if is_json {
        FsmDefinition::from_json(&content)
    } else {
        FsmDefinition::from_yaml(&content)
    }
    .with_context(|| format!("Invalid definition {}", path.display()))?;
    debug!(
        name = %definition.name,
        initial = %definition.initial,
        steps = states.len(),
        "Replaying path"
    );

    let store = std::sync::Arc::new(InMemoryStateStore::new());
    let mut fsm = FsmBuilder::<()>::new(definition.name.clone(), definition)
        .store(store.clone())
        .build()?;

    println!("start: {}", fsm.current_state());
    for state in states {
        match fsm.transition_to(state, &()).await {
            Ok(record) => println!("  #{} {} -> {}", record.sequence, record.from, record.to),
            Err(failure) => {
                let available = fsm.available_transitions().join(", ");
                bail!("{} (from '{}' you can reach: [{}])", failure, fsm.current_state(), available);
            }
        }
    }

    let persisted = store.get_state(fsm.id()).await?.unwrap_or_default();
    println!("end: {} (persisted: {})", fsm.current_state(), persisted);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Check { config } => check(&config),
        Commands::Resolve {
            config,
            resource,
            format,
        } => resolve(&config, resource.as_deref(), format),
        Commands::Backoff {
            config,
            resource,
            attempts,
        } => print_backoff(config.as_deref(), &resource, attempts),
        Commands::Walk { definition, states } => walk(&definition, &states).await,
    }
}
