//! Tile metadata command - print the metadata of a local or remote tile.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tilefetch::config::ConfigFile;
use tilefetch::download::ReqwestTransport;
use tilefetch::tile::{fetch_tile_metadata, read_tile_metadata, TileMetadata};

use super::common::{http_clients, ProxyArgs};
use crate::error::CliError;

/// Arguments for the tile-metadata command.
#[derive(Debug, Args)]
#[command(group(
    clap::ArgGroup::new("tile")
        .required(true)
        .args(["file", "url"]),
))]
pub struct TileMetadataArgs {
    /// Path of a downloaded tile
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// URL of a tile; only the bytes needed are fetched
    #[arg(long)]
    pub url: Option<String>,

    /// Print the metadata document as stored in the tile
    #[arg(long)]
    pub raw: bool,

    #[command(flatten)]
    pub proxy: ProxyArgs,
}

/// Run the tile-metadata command.
pub fn run(args: TileMetadataArgs, config: &ConfigFile) -> Result<(), CliError> {
    let metadata = match (&args.file, &args.url) {
        (Some(path), _) => read_tile_metadata(path)?,
        (None, Some(url)) => {
            let settings = config.download_settings();
            let clients = http_clients(&settings, &args.proxy, config)?;
            fetch_tile_metadata(Arc::new(ReqwestTransport::new(clients)), url, &settings.referer)?
        }
        (None, None) => return Err(CliError::Config("Either --file or --url is required".to_string())),
    };

    let mut stdout = std::io::stdout().lock();
    if args.raw {
        stdout.write_all(&metadata.raw)?;
    } else {
        stdout.write_all(summary(&metadata).as_bytes())?;
    }
    stdout.flush()?;
    Ok(())
}

/// YAML summary of the fields the acquisition flow uses.
fn summary(metadata: &TileMetadata) -> String {
    let mut out = format!(
        "name: {}\nproduct_version: {:?}\n",
        metadata.name, metadata.product_version
    );
    match &metadata.stemcell_criteria {
        Some(criteria) => {
            out.push_str("stemcell_criteria:\n");
            out.push_str(&format!("  os: {}\n", criteria.os));
            out.push_str(&format!("  version: {:?}\n", criteria.version));
            out.push_str(&format!(
                "  enable_patch_security_updates: {}\n",
                criteria.enable_patch_security_updates
            ));
        }
        None => out.push_str("stemcell_criteria: null\n"),
    }
    out
}
