//! fairflip simulator
//!
//! Runs an N-party flip over the in-memory chat and prints the outcome, or
//! re-verifies a saved game history.

use clap::{Parser, Subcommand, ValueEnum};
use fairflip::{
    config::{ConfigLoader, DealerConfig},
    replay::{replay_game, GameMessageReplayed},
    sim::run_simulated_flip,
    types::FlipParameters,
};
use num_bigint::BigInt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Provably fair multi-party flips, simulated
#[derive(Parser)]
#[command(name = "fairflip-sim")]
#[command(about = "Run and audit simulated multi-party coin flips")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FlipKind {
    Bool,
    Int,
    Big,
    Shuffle,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one flip among simulated players
    Flip {
        /// Number of participants, leader included
        #[arg(short, long, default_value = "3")]
        players: usize,

        /// What to flip for
        #[arg(short, long, value_enum, default_value = "bool")]
        kind: FlipKind,

        /// Modulus for int/big flips, or deck size for shuffles
        #[arg(short, long, default_value = "100")]
        modulus: String,

        /// Write the archived game history here as JSON
        #[arg(long)]
        save_history: Option<PathBuf>,

        /// Seconds to wait for each participant's updates
        #[arg(long, default_value = "10")]
        wait_secs: u64,
    },

    /// Re-verify a saved game history
    Replay {
        /// JSON history written by `flip --save-history`
        history: PathBuf,
    },
}

fn flip_parameters(kind: FlipKind, modulus: &str) -> Result<FlipParameters, Box<dyn std::error::Error>> {
    let params = match kind {
        FlipKind::Bool => FlipParameters::Bool,
        FlipKind::Int => FlipParameters::Int(modulus.parse()?),
        FlipKind::Big => FlipParameters::big(&modulus.parse::<BigInt>()?),
        FlipKind::Shuffle => FlipParameters::Shuffle(modulus.parse()?),
    };
    Ok(params)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "fairflip=debug" } else { "fairflip=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config: DealerConfig = match &cli.config {
        Some(path) => ConfigLoader::new().with_path(path).load()?,
        None => ConfigLoader::new().load()?,
    };

    match cli.command {
        Commands::Flip {
            players,
            kind,
            modulus,
            save_history,
            wait_secs,
        } => {
            let params = flip_parameters(kind, &modulus)?;
            info!(players, ?kind, "running simulated flip");
            let flip = run_simulated_flip(players, params, config, Duration::from_secs(wait_secs)).await?;

            if let Some(path) = save_history {
                std::fs::write(&path, serde_json::to_string_pretty(&flip.history)?)?;
                info!(path = %path.display(), messages = flip.history.len(), "saved game history");
            }

            let agreed = flip.outcomes.windows(2).all(|w| w[0] == w[1]);
            let report = serde_json::json!({
                "game_id": flip.game_id.to_string(),
                "players": players,
                "agreed": agreed,
                "outcome": flip.outcomes.first(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !agreed {
                return Err("participants disagree on the outcome".into());
            }
        }
        Commands::Replay { history } => {
            let text = std::fs::read_to_string(&history)?;
            let history: Vec<GameMessageReplayed> = serde_json::from_str(&text)?;
            let summary = replay_game(&history, &config)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
