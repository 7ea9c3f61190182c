//! # Command Line Interface
//!
//! `latchkey providers`, `latchkey resolve` and `latchkey check-config`.

pub mod config_cmd;
pub mod output;
pub mod providers;
pub mod resolve;

use crate::config::{load_config, load_dotenv, AppConfig};
use crate::observability::{init_observability, log_config_info};
use crate::secrets::SecretResolver;
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "latchkey")]
#[command(about = "Resolve secret references against external secret stores")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to ./latchkey.yml when present)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the available secrets providers and their parameters
    #[command(
        after_help = "EXAMPLES:\n    # Table of providers\n    latchkey providers\n\n    # Full parameter schemas as JSON\n    latchkey providers --output json"
    )]
    Providers {
        /// Output format (json, yaml, or table)
        #[arg(short, long, default_value = "table", value_parser = ["json", "yaml", "table"])]
        output: String,
    },

    /// Resolve one secret reference
    #[command(
        after_help = "EXAMPLES:\n    # Check that a Vault secret resolves\n    latchkey resolve hashicorp-vault -p path=apps/db -p key=password\n\n    # Print the value\n    latchkey resolve azure-key-vault -p vault_url=https://kv.vault.azure.net -p secret_name=db --reveal\n\n    # Templated parameters\n    latchkey resolve one-password -p vault=Infra -p 'item={{ obj.site }}-admin' -p field=password --context '{\"site\": \"ams01\"}'"
    )]
    Resolve {
        /// Provider id, e.g. hashicorp-vault
        #[arg(value_name = "PROVIDER")]
        provider: String,

        /// Provider parameter (repeatable)
        #[arg(short = 'p', long = "param", value_name = "KEY=VALUE", value_parser = resolve::parse_key_val)]
        params: Vec<(String, String)>,

        /// Reference name used in error messages
        #[arg(long)]
        name: Option<String>,

        /// JSON object that {{ obj.* }} placeholders render against
        #[arg(long, value_name = "JSON")]
        context: Option<String>,

        /// Print the secret value to stdout
        #[arg(long)]
        reveal: bool,
    },

    /// Validate the configuration and report the usable providers
    CheckConfig {
        /// Output format (json, yaml, or table)
        #[arg(short, long, default_value = "table", value_parser = ["json", "yaml", "table"])]
        output: String,
    },
}

/// Run CLI commands
pub async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    load_dotenv();

    let mut config = load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    if cli.verbose {
        config.logging.level = "info,latchkey=debug".to_string();
    }
    init_observability(&config)?;
    log_config_info(&config);

    let resolver = build_resolver(&config)?;

    match cli.command {
        Commands::Providers { output } => {
            providers::handle_providers_command(&resolver.list_available_backends(), &output)?
        }
        Commands::Resolve { provider, params, name, context, reveal } => {
            let reference = resolve::build_reference(provider, params, name, context)?;
            resolve::handle_resolve_command(&resolver, reference, reveal).await?
        }
        Commands::CheckConfig { output } => {
            config_cmd::handle_check_config_command(&config, &resolver, &output)?
        }
    }

    Ok(())
}

fn build_resolver(config: &AppConfig) -> anyhow::Result<SecretResolver> {
    SecretResolver::from_config(config).context("Failed to build the secrets provider registry")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_resolve() {
        let cli = Cli::try_parse_from([
            "latchkey",
            "resolve",
            "cyberark-cli-password-sdk",
            "-p",
            "app_id=billing",
            "--param",
            "safe=Ops",
            "--name",
            "db",
            "--reveal",
            "--config",
            "/etc/latchkey.yml",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("/etc/latchkey.yml")));
        match cli.command {
            Commands::Resolve { provider, params, name, reveal, context } => {
                assert_eq!(provider, "cyberark-cli-password-sdk");
                assert_eq!(params.len(), 2);
                assert_eq!(params[1], ("safe".to_string(), "Ops".to_string()));
                assert_eq!(name.as_deref(), Some("db"));
                assert!(reveal);
                assert!(context.is_none());
            }
            _ => panic!("expected resolve"),
        }
    }

    #[test]
    fn test_parse_rejects_bad_output_and_params() {
        assert!(Cli::try_parse_from(["latchkey", "providers", "--output", "xml"]).is_err());
        assert!(Cli::try_parse_from(["latchkey", "resolve", "one-password", "-p", "broken"]).is_err());
        assert!(Cli::try_parse_from(["latchkey", "check-config", "-o", "json"]).is_ok());
    }
}
