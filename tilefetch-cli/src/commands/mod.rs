//! CLI commands.

pub mod common;
pub mod download_product;
pub mod tile_metadata;
