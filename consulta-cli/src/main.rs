//! Command line front end that runs paid lookups through the consulta engine.

mod engine;

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use consulta_core::{EngineConfig, ExecutionInput, LookupRequest, TenantId, UserId};

use crate::engine::Engine;

#[derive(Parser, Debug)]
#[command(name = "consulta")]
#[command(version)]
#[command(about = "Run identity, vehicle, credit, and postal code lookups", long_about = None)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(long, short, env = "CONSULTA_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the services offered by the registered plugins
    Services,
    /// Execute one lookup and print the result with the resulting balance
    Run {
        /// Plugin to execute, e.g. `infosimples` or `viacep`
        #[arg(long)]
        plugin: String,

        /// Tenant issuing the lookup
        #[arg(long, default_value = "default")]
        tenant: String,

        /// User charged for the lookup
        #[arg(long, default_value = "cli")]
        user: String,

        /// Starting credits of the user
        #[arg(long, default_value = "10.00")]
        credits: Decimal,

        /// Correlation id attached to the billing transaction
        #[arg(long)]
        consulta_id: Option<String>,

        /// Lookup as JSON, e.g. '{"service":"cep","cep":"01001-000"}'
        #[arg(value_name = "REQUEST")]
        request: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let engine = Engine::build(config).await?;

    match cli.command {
        Command::Services => print_json(&engine.services()),
        Command::Run {
            plugin,
            tenant,
            user,
            credits,
            consulta_id,
            request,
        } => {
            let lookup: LookupRequest =
                serde_json::from_str(&request).context("REQUEST is not a valid lookup")?;
            let mut input = ExecutionInput::new(lookup);
            input.consulta_id = consulta_id;

            let user = UserId::from(user);
            engine.open_account(&user, credits);
            let report = engine
                .run(&plugin, TenantId::from(tenant), user, input)
                .await?;
            print_json(&report)
        }
    }
}

#[expect(clippy::print_stdout, reason = "results are the program's output")]
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
