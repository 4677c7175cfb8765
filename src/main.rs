use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eyre::{bail, Result, WrapErr};
use tracing_subscriber::EnvFilter;

use medtrace::features::FEATURE_LEN;
use medtrace::model::{RiskModel, DEFAULT_MODEL_PATH};
use medtrace::server::{run_server, ServerConfig};
use medtrace::signature::compute_signature;

/// Environment variable carrying the QR signing secret.
const QR_SECRET_ENV: &str = "MEDTRACE_QR_SECRET";

#[derive(Parser)]
#[command(name = "medtrace", version, about = "Pharmaceutical unit verification service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the verification HTTP server.
    Serve {
        /// Address to bind to.
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,
        /// SQLite database file.
        #[arg(long, default_value = "medtrace.db")]
        db: PathBuf,
        /// Risk classifier weights artifact.
        #[arg(long, default_value = DEFAULT_MODEL_PATH)]
        model: PathBuf,
        /// Registry mirror base URL for event-log reads.
        #[arg(long, default_value = "http://127.0.0.1:5551/api/v1")]
        ledger_url: String,
        /// Topic submit base URL for notification fan-out.
        #[arg(long, default_value = "http://127.0.0.1:5552/api/v1")]
        notify_url: String,
        /// Requests per minute per IP (0 disables limiting).
        #[arg(long, default_value_t = 60)]
        rate_limit: u32,
        /// JSONL access log path.
        #[arg(long, default_value = "medtrace-access.jsonl")]
        access_log: String,
    },
    /// Compute the QR signature for a unit tuple (issuing-side helper).
    Sign {
        /// Unit serial number, e.g. SER-ABC-123-0007.
        serial: String,
        /// Batch identifier, e.g. ABC-123.
        batch: String,
        /// Registry sequence number assigned at mint time.
        sequence: u64,
    },
    /// Score a feature vector against a model artifact.
    Score {
        /// JSON file containing an array of feature values.
        features: PathBuf,
        /// Risk classifier weights artifact.
        #[arg(long, default_value = DEFAULT_MODEL_PATH)]
        model: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("medtrace=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            bind,
            db,
            model,
            ledger_url,
            notify_url,
            rate_limit,
            access_log,
        } => {
            let qr_secret = std::env::var(QR_SECRET_ENV)
                .wrap_err_with(|| format!("{QR_SECRET_ENV} must be set to the QR signing secret"))?;
            if qr_secret.is_empty() {
                bail!("{QR_SECRET_ENV} is set but empty");
            }

            let config = ServerConfig {
                bind_addr: bind,
                db_path: db,
                model_path: model,
                ledger_url,
                notify_url,
                qr_secret,
                rate_limit_rpm: rate_limit,
                access_log_path: access_log,
                ..Default::default()
            };
            run_server(config).await
        }
        Command::Sign {
            serial,
            batch,
            sequence,
        } => {
            let secret = std::env::var(QR_SECRET_ENV)
                .wrap_err_with(|| format!("{QR_SECRET_ENV} must be set to the QR signing secret"))?;
            println!("{}", compute_signature(&serial, &batch, sequence, &secret));
            Ok(())
        }
        Command::Score { features, model } => {
            let raw = std::fs::read_to_string(&features)
                .wrap_err_with(|| format!("reading features from {}", features.display()))?;
            let values: Vec<f32> =
                serde_json::from_str(&raw).wrap_err("features file must be a JSON array of numbers")?;
            if values.len() != FEATURE_LEN {
                bail!(
                    "expected {FEATURE_LEN} features, got {}",
                    values.len()
                );
            }

            let model = RiskModel::load(&model)?;
            let prediction = model.predict(&values)?;
            println!(
                "label={} probability={:.4} (p_low={:.4} p_high={:.4})",
                prediction.label,
                prediction.probability,
                prediction.probabilities[0],
                prediction.probabilities[1]
            );
            Ok(())
        }
    }
}
