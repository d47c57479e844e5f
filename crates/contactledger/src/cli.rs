//! Command-line arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Extract, deduplicate and enrich contacts from your mailboxes.
#[derive(Debug, Parser)]
#[command(name = "contactledger", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run extraction, merge and enrichment, then write the result as JSON.
    Run(RunArgs),
    /// Store an `OAuth2` token (JSON file) for a provider in the keyring.
    StoreToken {
        /// Provider name as used in the config.
        #[arg(long)]
        provider: String,
        /// JSON file with `access_token`, optional `refresh_token` and `expires_at`.
        #[arg(long)]
        file: PathBuf,
    },
    /// Store an enrichment source API key in the keyring, read from stdin.
    StoreApiKey {
        /// Enrichment source name, e.g. `hunter`.
        #[arg(long)]
        source: String,
    },
}

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Run configuration (JSON). Defaults to the user config directory.
    #[arg(long, env = "CONTACTLEDGER_CONFIG")]
    pub config: Option<PathBuf>,
    /// Write the result here instead of stdout.
    #[arg(long, short)]
    pub output: Option<PathBuf>,
    /// Override the look-back window.
    #[arg(long)]
    pub days_back: Option<u32>,
    /// Only run these providers (repeatable).
    #[arg(long = "provider")]
    pub providers: Vec<String>,
    /// Force the enrichment stage on.
    #[arg(long, conflicts_with = "no_enrich")]
    pub enrich: bool,
    /// Skip the enrichment stage.
    #[arg(long)]
    pub no_enrich: bool,
    /// Hunter API key, used when none is stored in the keyring.
    #[arg(long, env = "HUNTER_API_KEY", hide_env_values = true)]
    pub hunter_api_key: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from([
            "contactledger",
            "run",
            "--config",
            "run.json",
            "--days-back",
            "7",
            "--provider",
            "work",
            "--provider",
            "home",
            "--no-enrich",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.config, Some(PathBuf::from("run.json")));
        assert_eq!(args.days_back, Some(7));
        assert_eq!(args.providers, ["work", "home"]);
        assert!(args.no_enrich);
    }

    #[test]
    fn test_enrich_flags_conflict() {
        assert!(Cli::try_parse_from(["contactledger", "run", "--enrich", "--no-enrich"]).is_err());
    }
}
