use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

use calib_orchestrator::{
    BoxConflictScheduler, CouplingScheduler, OrderingKind, Qid, ScheduleNode, WiringConfig, WiringTopology,
    resolve_wiring_path,
};

#[derive(Parser)]
#[command(name = "calib-orchestrator")]
#[command(about = "Box-conflict aware calibration scheduling")]
struct Cli {
    /// Wiring description (defaults to CALIB_WIRING_CONFIG, then XDG config, then ./wiring.json)
    #[arg(long, global = true)]
    wiring: Option<PathBuf>,
    /// Fail on MUXes whose modules match no box type
    #[arg(long, global = true, env = "CALIB_STRICT_WIRING", default_value_t = false)]
    strict: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print box stages with per-MUX parallel groups
    Schedule {
        #[command(flatten)]
        targets: QubitTargets,
        #[arg(long, env = "CALIB_ORDERING", default_value = "ascending")]
        ordering: OrderingKind,
    },
    /// Print globally barriered steps
    Synchronized {
        #[command(flatten)]
        targets: QubitTargets,
        #[arg(long, env = "CALIB_ORDERING", default_value = "ascending")]
        ordering: OrderingKind,
    },
    /// Print coupling rounds
    Couplings {
        /// Comma-separated coupling ids, e.g. 0-1,4-5
        #[arg(long, value_delimiter = ',', required = true)]
        couplings: Vec<String>,
        #[arg(long, env = "CALIB_MAX_PARALLEL_OPS")]
        max_parallel_ops: Option<usize>,
    },
}

#[derive(clap::Args)]
struct QubitTargets {
    /// Comma-separated qubit ids
    #[arg(long, value_delimiter = ',')]
    qids: Vec<String>,
    /// Comma-separated MUX ids; every qubit of each MUX is scheduled
    #[arg(long, value_delimiter = ',')]
    muxes: Vec<u32>,
}

impl QubitTargets {
    fn resolve(&self, topology: &WiringTopology) -> Result<Vec<Qid>> {
        let mut qids: Vec<Qid> = self.qids.iter().map(|q| Qid::new(q.trim())).collect();
        for &mux in &self.muxes {
            let owned = topology.qids_of_mux(mux);
            if owned.is_empty() {
                bail!("MUX {mux} is not in the wiring");
            }
            qids.extend(owned);
        }
        if qids.is_empty() {
            qids = topology.muxes().flat_map(|mux| topology.qids_of_mux(mux)).collect();
        }
        Ok(qids)
    }
}

fn load_topology(cli: &Cli) -> Result<Arc<WiringTopology>> {
    let path = match &cli.wiring {
        Some(path) => path.clone(),
        None => resolve_wiring_path()?,
    };
    info!("Loading wiring from {}", path.display());
    let config = WiringConfig::load(&path)?;
    Ok(Arc::new(WiringTopology::from_config(&config, cli.strict)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("calib_orchestrator=info".parse()?))
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let topology = load_topology(&cli)?;

    let output = match &cli.command {
        Commands::Schedule { targets, ordering } => {
            let qids = targets.resolve(&topology)?;
            info!("Scheduling {} qubits on chip {}", qids.len(), topology.chip_id());
            let stages = BoxConflictScheduler::new(topology.clone())
                .with_ordering(ordering.strategy())
                .generate(&qids)?;
            json!({
                "chip_id": topology.chip_id(),
                "stages": stages,
                "tree": ScheduleNode::from_stages(&stages),
            })
        }
        Commands::Synchronized { targets, ordering } => {
            let qids = targets.resolve(&topology)?;
            info!("Scheduling {} qubits in synchronized steps", qids.len());
            let steps = BoxConflictScheduler::new(topology.clone())
                .with_ordering(ordering.strategy())
                .generate_synchronized(&qids)?;
            json!({
                "chip_id": topology.chip_id(),
                "steps": steps,
                "tree": ScheduleNode::from_steps(&steps),
            })
        }
        Commands::Couplings {
            couplings,
            max_parallel_ops,
        } => {
            let couplings: Vec<Qid> = couplings.iter().map(|c| Qid::new(c.trim())).collect();
            info!("Scheduling {} couplings", couplings.len());
            let stages = CouplingScheduler::new(topology.clone())
                .with_max_parallel_ops(*max_parallel_ops)
                .generate(&couplings)?;
            json!({
                "chip_id": topology.chip_id(),
                "stages": stages,
                "tree": ScheduleNode::from_coupling_stages(&stages),
            })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
