//! SHA-256 checksum calculation for downloaded artifacts.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{FetchError, FetchResult};

/// Buffer size for reading files during checksum calculation (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Calculate the SHA-256 checksum of a file.
///
/// # Returns
///
/// The lowercase hexadecimal SHA-256 hash of the file contents.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn calculate_file_checksum(path: &Path) -> FetchResult<String> {
    let mut file = File::open(path).map_err(|e| FetchError::io("could not open", path, e))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| FetchError::io("could not read", path, e))?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify that a file matches the SHA-256 declared by `source_name`.
///
/// The comparison ignores case of the expected hex digest.
pub fn verify_checksum(path: &Path, expected: &str, source_name: &str) -> FetchResult<()> {
    let actual = calculate_file_checksum(path)?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(FetchError::ChecksumMismatch {
            source_name: source_name.to_string(),
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write;
    use tempfile::TempDir;

    const HELLO_WORLD_SHA: &str =
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn write_file(dir: &TempDir, name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[test]
    fn test_calculate_file_checksum() {
        let temp = TempDir::new().unwrap();
        let path = write_file(&temp, "test.txt", b"hello world");

        assert_eq!(calculate_file_checksum(&path).unwrap(), HELLO_WORLD_SHA);
    }

    #[test]
    fn test_calculate_empty_file() {
        let temp = TempDir::new().unwrap();
        let path = write_file(&temp, "empty.txt", b"");

        assert_eq!(
            calculate_file_checksum(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_calculate_nonexistent_file() {
        let err = calculate_file_checksum(Path::new("/nonexistent/file.txt")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_verify_checksum_accepts_uppercase() {
        let temp = TempDir::new().unwrap();
        let path = write_file(&temp, "test.txt", b"hello world");

        verify_checksum(&path, &HELLO_WORLD_SHA.to_uppercase(), "pivnet").unwrap();
    }

    #[test]
    fn test_verify_checksum_mismatch_names_source() {
        let temp = TempDir::new().unwrap();
        let path = write_file(&temp, "test.txt", b"hello world");

        let err = verify_checksum(&path, "deadbeef", "pivnet").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
        let msg = err.to_string();
        assert!(msg.contains("pivnet"));
        assert!(msg.contains("deadbeef"));
        assert!(msg.contains(HELLO_WORLD_SHA));
    }

    #[test]
    fn test_large_file_checksum() {
        let temp = TempDir::new().unwrap();
        // Larger than the read buffer
        let path = write_file(&temp, "large.bin", &vec![0xABu8; 100_000]);

        let checksum = calculate_file_checksum(&path).unwrap();
        assert_eq!(checksum, calculate_file_checksum(&path).unwrap());
        assert_eq!(checksum.len(), 64);
    }
}
