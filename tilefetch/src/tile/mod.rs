//! Tile inspection.
//!
//! Reads the metadata document of a tile, either from a local file or over
//! HTTP range requests so that a remote tile can be inspected before it is
//! downloaded.

mod metadata;
mod range_reader;

pub use metadata::{
    extract_metadata, fetch_tile_metadata, is_metadata_entry, parse_metadata, read_tile_metadata,
    StemcellCriteria, TileMetadata,
};
pub use range_reader::{HttpRangeReader, DEFAULT_BLOCK_SIZE};
