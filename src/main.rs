//! Expense inference service.
//!
//! Loads the trained pipeline once, then serves `POST /predict`. The `features`
//! and `predict` commands run single request bodies from the command line.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use expense_inference::{derive, server, Config, ExpensePredictor, RawPersonInput};
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "expense-inference")]
#[command(about = "Medical expense prediction service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the model and serve HTTP predictions
    Serve {
        #[command(flatten)]
        model: ModelArgs,

        /// Listen address
        #[arg(long, env = "EXPENSE_BIND_ADDR", default_value = "0.0.0.0:8000")]
        bind: SocketAddr,
    },

    /// Print the derived feature record for one request body
    Features {
        /// JSON file with the request body (stdin if omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Run one request body through the full prediction pipeline
    Predict {
        #[command(flatten)]
        model: ModelArgs,

        /// JSON file with the request body (stdin if omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ModelArgs {
    /// Path to the ONNX model
    #[arg(short, long, env = "EXPENSE_MODEL_PATH", default_value = "insurance_model.onnx")]
    model: PathBuf,

    /// Intra-op threads per inference call
    #[arg(long, default_value = "1")]
    intra_threads: usize,

    /// Disable graph optimization
    #[arg(long)]
    no_optimize: bool,
}

impl ModelArgs {
    fn into_config(self) -> Config {
        Config {
            model_path: self.model,
            optimize_graph: !self.no_optimize,
            intra_threads: self.intra_threads,
            ..Config::default()
        }
    }
}

fn read_input(path: Option<&PathBuf>) -> Result<RawPersonInput> {
    let text = match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    serde_json::from_str(&text).context("request body is not a JSON object")
}

fn load_predictor(config: &Config) -> Result<ExpensePredictor> {
    ExpensePredictor::from_config(config)
        .with_context(|| format!("cannot start without a model ({})", config.model_path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Serve { model, bind } => {
            let config = Config {
                bind_addr: bind,
                ..model.into_config()
            };
            let predictor = load_predictor(&config)?;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(server::serve(&config, predictor))?;
        }

        Commands::Features { input } => {
            let raw = read_input(input.as_ref())?;
            match derive(&raw) {
                Ok(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                Err(err) => {
                    println!("{}", serde_json::to_string_pretty(&err)?);
                    anyhow::bail!("input rejected: {err}");
                }
            }
        }

        Commands::Predict { model, input } => {
            let config = model.into_config();
            let predictor = load_predictor(&config)?;
            let raw = read_input(input.as_ref())?;

            match predictor.predict(&raw) {
                Ok(prediction) => {
                    info!(expense = prediction.predicted_expense, "prediction complete");
                    println!("{}", serde_json::to_string_pretty(&prediction)?);
                }
                Err(err) => {
                    error!(%err, "prediction failed");
                    return Err(err.into());
                }
            }
        }
    }

    Ok(())
}
