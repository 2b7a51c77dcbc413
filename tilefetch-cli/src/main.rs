//! Tilefetch CLI - Command-line interface
//!
//! Downloads product tiles and their stemcells from the catalog service or a
//! blob store mirror.

mod commands;
mod error;
mod progress;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tilefetch::logging;
use tokio_util::sync::CancellationToken;

use commands::download_product::DownloadProductArgs;
use commands::tile_metadata::TileMetadataArgs;
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "tilefetch", version, about = "Download product tiles and matching stemcells")]
struct Cli {
    /// Configuration file (defaults to $XDG_CONFIG_HOME/tilefetch/config.ini)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download a product file and, optionally, a compatible stemcell
    DownloadProduct(Box<DownloadProductArgs>),

    /// Print the metadata of a tile
    TileMetadata(TileMetadataArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = commands::common::load_config(cli.config.as_deref())?;

    // -v beats the config file; RUST_LOG beats both
    let level = match (&config.logging.level, cli.verbose) {
        (Some(level), 0) => logging::parse_level(level)?,
        _ => logging::level_for_verbosity(cli.verbose),
    };
    let _guard = logging::init(level, config.logging.file.as_deref())?;

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("Received interrupt, cancelling downloads...");
        handler_token.cancel();
    })
    .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))?;

    match cli.command {
        Commands::DownloadProduct(args) => commands::download_product::run(*args, &config, cancel),
        Commands::TileMetadata(args) => commands::tile_metadata::run(args, &config),
    }
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
    fn test_download_product_requires_version() {
        let result = Cli::try_parse_from([
            "tilefetch",
            "download-product",
            "--pivnet-product-slug",
            "example",
            "--file-glob",
            "*.pivotal",
            "--output-directory",
            "/tmp",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_download_product_parses() {
        let cli = Cli::try_parse_from([
            "tilefetch",
            "-vv",
            "download-product",
            "--source",
            "local",
            "--pivnet-product-slug",
            "example",
            "--product-version-regex",
            r"^1\.",
            "--file-glob",
            "*.pivotal",
            "--output-directory",
            "/tmp",
            "--stemcell-iaas",
            "aws",
            "--stemcell-heavy",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::DownloadProduct(args) => {
                assert_eq!(args.source, Some(commands::common::SourceKind::Local));
                assert_eq!(args.stemcell_iaas.as_deref(), Some("aws"));
                assert!(args.stemcell_heavy);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
