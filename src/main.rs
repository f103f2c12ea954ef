use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sqlx_router::config::{Config, LoggingConfig};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sqlx-router")]
#[command(about = "Read/write splitting and weighted load balancing over database clusters")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Side {
    Read,
    Write,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate example configuration files
    Config {
        /// Configuration mode (cluster or standalone)
        #[arg(short, long)]
        mode: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file and the topology it describes
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Draw selections from a load balancer and print the distribution
    Simulate {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
        /// Cluster to draw from; the global balancers are used when omitted
        #[arg(long)]
        cluster: Option<String>,
        /// Balancer side
        #[arg(short, long, value_enum, default_value = "read")]
        side: Side,
        /// Number of selections
        #[arg(short = 'n', long, default_value_t = 10_000)]
        count: u64,
    },
    /// Show version information
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { mode, output } => generate_config(mode, output),
        Commands::Validate { config } => validate_config(config),
        Commands::Simulate {
            config,
            cluster,
            side,
            count,
        } => simulate(config, cluster, side, count),
        Commands::Version => {
            show_version();
            Ok(())
        }
    }
}

fn generate_config(mode: String, output: PathBuf) -> Result<()> {
    println!("Generating {} configuration file: {:?}", mode, output);

    Config::create_example_config(&output, &mode).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  sqlx-router validate --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    let config = match Config::load_from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            eprintln!("  {}", e);
            return Err(e.into());
        }
    };

    let configuration = match config.into_configuration() {
        Ok(configuration) => configuration,
        Err(e) => {
            eprintln!("✗ Topology validation failed:");
            eprintln!("  {}", e);
            return Err(e.into());
        }
    };

    let topology = configuration.snapshot();
    println!("✓ Configuration file is valid");
    println!("  Data sources: {}", topology.data_sources().len());
    for data_source in topology.data_sources() {
        println!(
            "    {} ({}, weight {}): {}",
            data_source.name, data_source.node_type, data_source.weight, data_source.url
        );
    }
    println!("  Clusters: {}", topology.clusters().len());
    for cluster in topology.clusters() {
        let nodes: Vec<&str> = cluster.node_attributes().iter().map(|n| n.name()).collect();
        println!(
            "    {}{}: [{}]",
            cluster.name,
            if cluster.defaulted { " (default)" } else { "" },
            nodes.join(", ")
        );
    }
    if !topology.pointcuts().is_empty() {
        println!("  Pointcuts: {}", topology.pointcuts().len());
        for pointcut in topology.pointcuts() {
            println!("    {} -> {:?} {:?}", pointcut.expression, pointcut.cluster, pointcut.nodes);
        }
    }

    Ok(())
}

fn simulate(config_path: PathBuf, cluster: Option<String>, side: Side, count: u64) -> Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    init_logging(&config.logging)?;

    let configuration = config.into_configuration()?;
    let topology = configuration.snapshot();
    info!("Topology loaded from {:?}", config_path);

    let owner = match &cluster {
        Some(name) => Some(
            topology
                .cluster(name)
                .ok_or_else(|| anyhow!("cluster {} does not exist", name))?,
        ),
        None => None,
    };
    let balancer = match (owner, side) {
        (Some(cluster), Side::Read) => cluster.read_load_balance(),
        (Some(cluster), Side::Write) => cluster.write_load_balance(),
        (None, Side::Read) => topology.read_load_balance(),
        (None, Side::Write) => topology.write_load_balance(),
    }
    .ok_or_else(|| anyhow!("no {:?} load balancer for {}", side, cluster.as_deref().unwrap_or("global scope")))?;

    debug!("Simulating {} selections with {:?}", count, balancer.spec());
    let mut distribution: BTreeMap<String, u64> = BTreeMap::new();
    for _ in 0..count {
        let node = balancer.choose()?;
        *distribution.entry(node.name().to_string()).or_default() += 1;
    }

    println!(
        "{} {:?} selections from {}:",
        count,
        side,
        cluster.as_deref().unwrap_or("global balancer")
    );
    for (node, hits) in &distribution {
        let weight = topology.node_attribute(node).map(|n| n.weight()).unwrap_or_default();
        println!(
            "  {:<16} weight {:>4}  {:>8}  {:>6.2}%",
            node,
            weight,
            hits,
            *hits as f64 * 100.0 / count.max(1) as f64
        );
    }

    Ok(())
}

fn show_version() {
    println!("sqlx-router v{}", env!("CARGO_PKG_VERSION"));
    println!("Read/write splitting and weighted load balancing over database clusters");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Weighted random and smooth weighted round robin balancers");
    println!("  • Sticky per-connection routing with lazy physical binding");
    println!("  • Live topology changes with validation and rollback");
    println!("  • Heartbeat node state monitoring");
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(log_writer(config)?);
    let result = match config.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", config.level);
    Ok(())
}

/// A configured file wins over stdout; stderr when neither is asked for
fn log_writer(config: &LoggingConfig) -> Result<BoxMakeWriter> {
    if let Some(path) = &config.file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path))?;
        return Ok(BoxMakeWriter::new(Mutex::new(file)));
    }
    if config.stdout {
        Ok(BoxMakeWriter::new(std::io::stdout))
    } else {
        Ok(BoxMakeWriter::new(std::io::stderr))
    }
}
