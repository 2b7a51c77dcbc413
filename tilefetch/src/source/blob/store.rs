//! Blob stores: flat namespaces of named objects.

use std::fs::{self, File};
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};

use crate::error::{FetchError, FetchResult};

/// A reader that can also seek.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Object storage holding mirrored artifacts.
///
/// Keys are `/`-separated. Implementations list every key; filtering by the
/// naming convention happens in [`BlobSource`](super::BlobSource).
pub trait BlobStore: Send + Sync {
    /// Identifier used in messages.
    fn name(&self) -> String;

    /// Every key in the store.
    fn list_keys(&self) -> FetchResult<Vec<String>>;

    /// Size of an object in bytes.
    fn size(&self, key: &str) -> FetchResult<u64>;

    /// Sequential reader over an object.
    fn open(&self, key: &str) -> FetchResult<Box<dyn Read + Send>>;

    /// Random access reader over an object, for reading tile metadata.
    fn open_seekable(&self, key: &str) -> FetchResult<Box<dyn ReadSeek>>;

    /// A URL serving the object with range support, if the store has one.
    fn download_url(&self, _key: &str) -> Option<String> {
        None
    }
}

/// A directory tree used as a blob store.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    fn walk(&self, dir: &Path, prefix: &str, keys: &mut Vec<String>) -> FetchResult<()> {
        let entries = fs::read_dir(dir).map_err(|e| FetchError::io("could not list", dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| FetchError::io("could not list", dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let key = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };

            let file_type = entry
                .file_type()
                .map_err(|e| FetchError::io("could not stat", entry.path(), e))?;
            if file_type.is_dir() {
                self.walk(&entry.path(), &key, keys)?;
            } else {
                keys.push(key);
            }
        }
        Ok(())
    }
}

impl BlobStore for LocalBlobStore {
    fn name(&self) -> String {
        format!("local store {}", self.root.display())
    }

    fn list_keys(&self) -> FetchResult<Vec<String>> {
        let mut keys = Vec::new();
        self.walk(&self.root, "", &mut keys)?;
        keys.sort();
        Ok(keys)
    }

    fn size(&self, key: &str) -> FetchResult<u64> {
        let path = self.path_for(key);
        fs::metadata(&path)
            .map(|metadata| metadata.len())
            .map_err(|e| FetchError::io("could not stat", path, e))
    }

    fn open(&self, key: &str) -> FetchResult<Box<dyn Read + Send>> {
        let path = self.path_for(key);
        let file = File::open(&path).map_err(|e| FetchError::io("could not open", path, e))?;
        Ok(Box::new(file))
    }

    fn open_seekable(&self, key: &str) -> FetchResult<Box<dyn ReadSeek>> {
        let path = self.path_for(key);
        let file = File::open(&path).map_err(|e| FetchError::io("could not open", path, e))?;
        Ok(Box::new(BufReader::new(file)))
    }
}
