//! The persistent update log.
//!
//! The log (normally `.upd/log`) remembers, for every file we generated, how
//! it was generated and what we got. Records are appended with synchronous
//! writes as soon as a file is updated, so a crash at any point (SIGINT, a
//! panic, power loss) leaves a valid prefix on disk and everything already
//! built stays cached. At the end of a run the log is compacted into a fresh
//! file and swapped in with an atomic rename.

mod read;
mod recorder;

pub use read::{read_log, CacheFileData, ReadError};
pub use recorder::Recorder;

use std::collections::HashMap;
use std::fs;
use std::io::{self, BufReader};

use itertools::Itertools;
use thiserror::Error;

/// On-disk format version. Logs written by other versions of the tool are
/// ignored and rebuilt from scratch.
pub const VERSION: u8 = 2;

pub(crate) const ENTITY_NAME_TAG: u8 = b'E';
pub(crate) const FILE_UPDATE_TAG: u8 = b'U';
pub(crate) const ROOT_ENT_ID: u16 = 0xFFFF;

/// How one particular file was generated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileRecord {
    /// Digest of the command line template that generated the file, plus the
    /// content of all its sources and dependencies. If the freshly computed
    /// imprint matches the record, the file is already up-to-date.
    pub imprint: u64,
    /// Digest of the generated file's own content, used to notice files
    /// modified or corrupted behind our back.
    pub hash: u64,
    /// Files the target depends on in addition to its direct sources, as
    /// declared by the update command through its depfile. For a C++ object
    /// file these are the headers.
    pub dependency_local_paths: Vec<String>,
}

pub type RecordsByFile = HashMap<String, FileRecord>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("update log is corrupted; delete or revert the `{}/log' file", crate::io::CACHE_FOLDER)]
    Corruption,
    #[error("failed to replace the update log by its rewritten version")]
    FailedToRewrite(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The in-memory copy of the update log. Additions are persisted right away
/// through the appending [`Recorder`].
pub struct Cache {
    recorder: Recorder,
    cached_records: RecordsByFile,
}

impl Cache {
    /// Load the log at `log_file_path`, or start an empty one if there is no
    /// log yet or it was written by another version of the tool.
    pub fn from_log_file(log_file_path: &str) -> Result<Cache, Error> {
        let file = match fs::File::open(log_file_path) {
            Ok(file) => file,
            Err(ref error) if error.kind() == io::ErrorKind::NotFound => {
                return Cache::fresh(log_file_path);
            }
            Err(error) => return Err(error.into()),
        };
        match read_log(&mut BufReader::new(file)) {
            Ok(data) => Ok(Cache {
                recorder: Recorder::resume(log_file_path, &data.ent_paths)?,
                cached_records: data.records,
            }),
            Err(ReadError::VersionMismatch) => Cache::fresh(log_file_path),
            Err(ReadError::Corruption) => Err(Error::Corruption),
            Err(ReadError::Io(error)) => Err(error.into()),
        }
    }

    fn fresh(log_file_path: &str) -> Result<Cache, Error> {
        Ok(Cache { recorder: Recorder::fresh(log_file_path)?, cached_records: HashMap::new() })
    }

    pub fn find(&self, local_file_path: &str) -> Option<&FileRecord> {
        self.cached_records.get(local_file_path)
    }

    /// Persist then remember a new record for `local_file_path`. Once this
    /// returns, the record is durable.
    pub fn record(&mut self, local_file_path: &str, record: FileRecord) -> io::Result<()> {
        self.recorder.record(local_file_path, &record)?;
        self.cached_records.insert(local_file_path.to_string(), record);
        Ok(())
    }

    pub fn records(&self) -> &RecordsByFile {
        &self.cached_records
    }

    /// Close the appending file descriptor and hand back the records, ready
    /// for the compacting rewrite.
    pub fn into_records(self) -> RecordsByFile {
        self.cached_records
    }
}

/// Write a compacted version of the log to `temporary_file_path` (exactly one
/// update record per live target), then atomically rename it over
/// `file_path`. A crash before the rename preserves the previous log.
pub fn rewrite_file(
    file_path: &str,
    temporary_file_path: &str,
    records: &RecordsByFile,
) -> Result<(), Error> {
    let mut fresh_recorder = Recorder::fresh(temporary_file_path)?;
    for file_path in records.keys().sorted() {
        fresh_recorder.record(file_path, &records[file_path])?;
    }
    drop(fresh_recorder);
    fs::rename(temporary_file_path, file_path).map_err(Error::FailedToRewrite)
}
