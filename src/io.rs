//! Filesystem capability seams.
//!
//! The crawler and the depfile parser work against the small traits defined
//! here rather than against `std::fs` directly, so that tests can substitute
//! in-memory variants that are structurally identical to the real ones.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::Path;

use thiserror::Error;

pub const ROOTFILE_NAME: &str = ".updroot";
pub const UPDFILE_NAME: &str = "updfile.json";
pub const CACHE_FOLDER: &str = ".upd";

/// No directory containing a `.updroot` file was found above the working
/// directory; upd has no project to operate on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "cannot find a `{}' file in the current directory or in any of the parent directories",
    ROOTFILE_NAME
)]
pub struct CannotFindRootError;

pub fn getcwd() -> io::Result<String> {
    let cwd = std::env::current_dir()?;
    Ok(cwd.to_string_lossy().into_owned())
}

fn is_regular_file(path: &str) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(metadata) => Ok(metadata.is_file()),
        Err(ref error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error),
    }
}

/// Walk up from `origin_path` to the closest directory marked with a
/// `.updroot` file. All the "local" paths handled by the engine are
/// expressed relative to that root.
pub fn find_root_path(origin_path: &str) -> Result<String, CannotFindRootError> {
    let mut path = origin_path.to_string();
    loop {
        match is_regular_file(&format!("{}/{}", path, ROOTFILE_NAME)) {
            Ok(true) => return Ok(path),
            Ok(false) | Err(_) => {}
        }
        if path == "/" {
            return Err(CannotFindRootError);
        }
        path = crate::path::dirname(&path);
    }
}

/// The type of a directory entry, as cheaply as the platform can tell. The
/// crawler falls back to an `lstat` call for `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntKind {
    Unknown,
    Regular,
    Directory,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEnt {
    pub name: String,
    pub kind: EntKind,
}

impl DirEnt {
    pub fn regular(name: &str) -> DirEnt {
        DirEnt { name: name.to_string(), kind: EntKind::Regular }
    }

    pub fn directory(name: &str) -> DirEnt {
        DirEnt { name: name.to_string(), kind: EntKind::Directory }
    }
}

/// Provides all the files and subdirectories of directories, one directory
/// open at a time.
pub trait DirectoryReader {
    fn open(&mut self, path: &str) -> io::Result<()>;
    fn close(&mut self);
    /// The next entry of the currently open directory, or `None` once
    /// exhausted. `.` and `..` are never yielded.
    fn next_ent(&mut self) -> io::Result<Option<DirEnt>>;
}

/// The real thing, on top of `std::fs::read_dir`.
#[derive(Default)]
pub struct FsDirectoryReader {
    entries: Option<fs::ReadDir>,
}

impl FsDirectoryReader {
    pub fn new() -> FsDirectoryReader {
        FsDirectoryReader { entries: None }
    }
}

impl DirectoryReader for FsDirectoryReader {
    fn open(&mut self, path: &str) -> io::Result<()> {
        self.entries = Some(fs::read_dir(path)?);
        Ok(())
    }

    fn close(&mut self) {
        self.entries = None;
    }

    fn next_ent(&mut self) -> io::Result<Option<DirEnt>> {
        let entries = match self.entries.as_mut() {
            Some(entries) => entries,
            None => return Ok(None),
        };
        match entries.next() {
            None => Ok(None),
            Some(entry) => {
                let entry = entry?;
                let kind = match entry.file_type() {
                    Err(_) => EntKind::Unknown,
                    Ok(file_type) => {
                        if file_type.is_dir() {
                            EntKind::Directory
                        } else if file_type.is_file() {
                            EntKind::Regular
                        } else {
                            EntKind::Unsupported
                        }
                    }
                };
                Ok(Some(DirEnt { name: entry.file_name().to_string_lossy().into_owned(), kind }))
            }
        }
    }
}

/// In-memory directory reader: a map from directory path to entry list.
/// Opening an unknown path fails with `NotFound` just like the real one.
#[derive(Default)]
pub struct MockDirectoryReader {
    dirs: HashMap<String, Vec<DirEnt>>,
    current: Vec<DirEnt>,
    next_ix: usize,
    is_open: bool,
}

impl MockDirectoryReader {
    pub fn new(dirs: HashMap<String, Vec<DirEnt>>) -> MockDirectoryReader {
        MockDirectoryReader { dirs, current: Vec::new(), next_ix: 0, is_open: false }
    }
}

impl DirectoryReader for MockDirectoryReader {
    fn open(&mut self, path: &str) -> io::Result<()> {
        match self.dirs.get(path) {
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such mock directory: {}", path),
            )),
            Some(ents) => {
                self.current = ents.clone();
                self.next_ix = 0;
                self.is_open = true;
                Ok(())
            }
        }
    }

    fn close(&mut self) {
        self.is_open = false;
    }

    fn next_ent(&mut self) -> io::Result<Option<DirEnt>> {
        if !self.is_open || self.next_ix >= self.current.len() {
            return Ok(None);
        }
        let ent = self.current[self.next_ix].clone();
        self.next_ix += 1;
        Ok(Some(ent))
    }
}

/// Byte source for the streaming parsers (depfile, update log).
pub trait CharReader {
    fn next_byte(&mut self) -> io::Result<Option<u8>>;
}

/// Buffered adapter from any `Read` to a `CharReader`, pulling 4 KiB blocks.
pub struct BlockCharReader<R: Read> {
    inner: R,
    buffer: [u8; 4096],
    next_ix: usize,
    end_ix: usize,
}

impl<R: Read> BlockCharReader<R> {
    pub fn new(inner: R) -> BlockCharReader<R> {
        BlockCharReader { inner, buffer: [0; 4096], next_ix: 0, end_ix: 0 }
    }
}

impl<R: Read> CharReader for BlockCharReader<R> {
    fn next_byte(&mut self) -> io::Result<Option<u8>> {
        if self.next_ix == self.end_ix {
            self.next_ix = 0;
            self.end_ix = loop {
                match self.inner.read(&mut self.buffer) {
                    Ok(count) => break count,
                    Err(ref error) if error.kind() == io::ErrorKind::Interrupted => continue,
                    Err(error) => return Err(error),
                }
            };
            if self.end_ix == 0 {
                return Ok(None);
            }
        }
        let byte = self.buffer[self.next_ix];
        self.next_ix += 1;
        Ok(Some(byte))
    }
}

pub fn nix_to_io_error(error: nix::Error) -> io::Error {
    match error.as_errno() {
        Some(errno) => io::Error::from_raw_os_error(errno as i32),
        None => io::Error::new(io::ErrorKind::Other, error),
    }
}

/// Create a FIFO (named pipe) readable and writable by the owner only.
pub fn mkfifo(path: &Path) -> io::Result<()> {
    nix::unistd::mkfifo(path, nix::sys::stat::Mode::S_IRWXU).map_err(nix_to_io_error)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn finds_the_root_marker_upward() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().to_string_lossy().into_owned();
        fs::create_dir_all(temp.path().join("b/c")).unwrap();
        fs::File::create(temp.path().join(ROOTFILE_NAME)).unwrap();
        let found = find_root_path(&format!("{}/b/c", root)).unwrap();
        assert_eq!(found, root);
    }

    #[test]
    fn reports_a_missing_root_marker() {
        let temp = tempfile::tempdir().unwrap();
        let origin = temp.path().to_string_lossy().into_owned();
        assert_eq!(find_root_path(&origin), Err(CannotFindRootError));
    }

    #[test]
    fn reads_bytes_in_blocks() {
        let data = b"ab".repeat(5000);
        let mut reader = BlockCharReader::new(&data[..]);
        let mut count = 0;
        while let Some(byte) = reader.next_byte().unwrap() {
            assert_eq!(byte, if count % 2 == 0 { b'a' } else { b'b' });
            count += 1;
        }
        assert_eq!(count, 10000);
    }

    #[test]
    fn mock_reader_mirrors_the_real_interface() {
        let mut dirs = HashMap::new();
        dirs.insert(
            "/proj/".to_string(),
            vec![DirEnt::directory("src"), DirEnt::regular("updfile.json")],
        );
        let mut reader = MockDirectoryReader::new(dirs);
        assert!(reader.open("/nope/").is_err());
        reader.open("/proj/").unwrap();
        assert_eq!(reader.next_ent().unwrap().unwrap().name, "src");
        assert_eq!(reader.next_ent().unwrap().unwrap().name, "updfile.json");
        assert_eq!(reader.next_ent().unwrap(), None);
    }

    #[test]
    fn creates_fifos() {
        let temp = tempfile::tempdir().unwrap();
        let fifo = temp.path().join("dep");
        mkfifo(&fifo).unwrap();
        let metadata = fs::symlink_metadata(&fifo).unwrap();
        assert!(!metadata.is_file() && !metadata.is_dir());
        // A FIFO with no writer would block a reader; a second creation
        // failing with EEXIST is enough of a sanity check.
        assert!(mkfifo(&fifo).is_err());
    }
}
