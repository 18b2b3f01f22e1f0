//! Content hashing and the file hash cache.
//!
//! Everything is hashed with 64-bit xxHash, seed 0. Composite digests are
//! built by hashing each element separately and streaming the element hashes
//! into an aggregating hasher; hashing raw concatenated bytes instead would
//! make `{"foo", "bar"}` and `{"f", "oobar"}` collide.

use std::fs;
use std::io::{self, Read};

use xxhash_rust::xxh64::{xxh64, Xxh64};

const BLOCK_SIZE: usize = 4096;

/// Aggregates several 64-bit hashes into a single digest.
pub struct HashStream {
    state: Xxh64,
}

impl HashStream {
    pub fn new(seed: u64) -> HashStream {
        HashStream { state: Xxh64::new(seed) }
    }

    pub fn push(&mut self, value: u64) -> &mut HashStream {
        self.state.update(&value.to_le_bytes());
        self
    }

    pub fn digest(&self) -> u64 {
        self.state.digest()
    }
}

pub fn hash_str(value: &str) -> u64 {
    xxh64(value.as_bytes(), 0)
}

/// Hash a sequence by aggregating the hashes of its elements.
pub fn hash_seq<I: IntoIterator<Item = u64>>(hashes: I) -> u64 {
    let mut stream = HashStream::new(0);
    for hash in hashes {
        stream.push(hash);
    }
    stream.digest()
}

/// Hash an entire file by streaming its content in 4 KiB blocks.
pub fn hash_file(seed: u64, file_path: &str) -> io::Result<u64> {
    let mut file = fs::File::open(file_path)?;
    let mut state = Xxh64::new(seed);
    let mut buffer = [0u8; BLOCK_SIZE];
    loop {
        let count = match file.read(&mut buffer) {
            Ok(count) => count,
            Err(ref error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        };
        if count == 0 {
            return Ok(state.digest());
        }
        state.update(&buffer[..count]);
    }
}

/// Memoizes content hashes by absolute file path. Several outputs routinely
/// share inputs (a C++ header affects many object files), so each input is
/// read once per run at most.
#[derive(Default)]
pub struct FileHashCache {
    cache: std::collections::HashMap<String, u64>,
}

impl FileHashCache {
    pub fn new() -> FileHashCache {
        FileHashCache::default()
    }

    /// The content hash of the file at `file_path`, which must be absolute.
    pub fn hash(&mut self, file_path: &str) -> io::Result<u64> {
        assert!(
            crate::path::is_path_absolute(file_path),
            "hash cache keys must be absolute paths, got `{}`",
            file_path
        );
        if let Some(&hash) = self.cache.get(file_path) {
            return Ok(hash);
        }
        let hash = hash_file(0, file_path)?;
        self.cache.insert(file_path.to_string(), hash);
        Ok(hash)
    }

    /// Drop the memoized digest, typically right before the file is
    /// regenerated.
    pub fn invalidate(&mut self, file_path: &str) {
        self.cache.remove(file_path);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn element_wise_hashing_avoids_concatenation_collisions() {
        let left = hash_seq(vec![hash_str("foo"), hash_str("bar")]);
        let right = hash_seq(vec![hash_str("f"), hash_str("oobar")]);
        assert_ne!(left, right);
    }

    #[test]
    fn hashes_files_and_memoizes() {
        let temp = tempfile::tempdir().unwrap();
        let file_path = temp.path().join("data");
        fs::write(&file_path, b"hello").unwrap();
        let path_str = file_path.to_string_lossy().into_owned();

        let mut cache = FileHashCache::new();
        let first = cache.hash(&path_str).unwrap();
        assert_eq!(first, xxh64(b"hello", 0));

        // Without invalidation the stale digest is served from memory.
        let mut file = fs::OpenOptions::new().append(true).open(&file_path).unwrap();
        file.write_all(b" world").unwrap();
        drop(file);
        assert_eq!(cache.hash(&path_str).unwrap(), first);

        cache.invalidate(&path_str);
        assert_eq!(cache.hash(&path_str).unwrap(), xxh64(b"hello world", 0));
    }

    #[test]
    fn missing_files_surface_not_found() {
        let mut cache = FileHashCache::new();
        let error = cache.hash("/no/such/upd/file").unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    #[should_panic]
    fn relative_paths_are_a_programmer_error() {
        let mut cache = FileHashCache::new();
        let _ = cache.hash("relative/path");
    }
}
