use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use proof_anchor::config::Config;
use proof_anchor::digest::Digest;
use proof_anchor::error::{ProofError, Result};
use proof_anchor::generation::Model;
use proof_anchor::server::{self, AppState};
use proof_anchor::service::{ProofRequest, ProofService, VerifyResponse};
use serde::Serialize;
use tracing::{error, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "proof-anchor")]
#[command(about = "Anchor AI prompt/response proofs on an EVM chain")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8000")]
        bind: String,
    },
    /// Generate a response and anchor the proof. With --response, anchor the given pair instead.
    Prove {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        response: Option<String>,
        #[arg(long, default_value = "gpt-4o")]
        model: Model,
        #[arg(long, default_value_t = 0.7)]
        temperature: f64,
    },
    /// Check a prompt/response pair against the local ledger and the chain
    Verify {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        response: String,
    },
    /// Retry anchoring a stored proof by its digest
    Anchor { digest: Digest },
    /// Show the proof recorded for a transaction hash
    Lookup { tx_hash: String },
    /// Promote records whose confirmation landed after the receipt wait
    Reconcile {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Show ledger and chain status
    Status,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| ProofError::Serialization(e.to_string()))?;
    println!("{text}");
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let service = ProofService::from_config(&cli.config).await?;

    match cli.command {
        Commands::Serve { bind } => {
            let state = AppState {
                service: Arc::new(service),
            };
            server::serve(state, &bind).await
        }
        Commands::Prove {
            prompt,
            response,
            model,
            temperature,
        } => {
            let request = ProofRequest {
                prompt,
                model,
                temperature,
            };
            let proof = match response {
                Some(response) => {
                    request.validate()?;
                    service
                        .record_and_anchor(request.prompt, response, model, temperature)
                        .await
                }
                None => service.prove(request).await?,
            };
            print_json(&proof)
        }
        Commands::Verify { prompt, response } => {
            let verification = service.verify(&prompt, &response).await?;
            print_json(&VerifyResponse::from(verification))
        }
        Commands::Anchor { digest } => print_json(&service.anchor(&digest).await?),
        Commands::Lookup { tx_hash } => print_json(&service.lookup(&tx_hash).await?),
        Commands::Reconcile { limit } => print_json(&service.reconcile(limit).await?),
        Commands::Status => {
            let mut health = serde_json::to_value(service.health().await)
                .map_err(|e| ProofError::Serialization(e.to_string()))?;
            health["proofs"] = service.ledger().count().await?.into();
            print_json(&health)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "proof-anchor failed");
            ExitCode::FAILURE
        }
    }
}
