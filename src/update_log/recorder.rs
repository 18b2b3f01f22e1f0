//! Appending writer for the update log.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;

use super::{FileRecord, ENTITY_NAME_TAG, FILE_UPDATE_TAG, ROOT_ENT_ID, VERSION};

/// Paths are interned as 16-bit entity ids: each path component gets an
/// `'E'` record defining a new id as "name under parent id". Update records
/// then refer to files by the leaf's id, which keeps repeatedly-recorded
/// deep paths cheap.
type EntIdsByPath = HashMap<String, u16>;

/// Writes records to the update log as updates complete. The file is opened
/// with `O_SYNC` so every completed record is durable: if the process is
/// interrupted, everything already written remains usable on the next run.
pub struct Recorder {
    file: File,
    ent_ids_by_path: EntIdsByPath,
}

fn open_for_append(file_path: &str, create_fresh: bool) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options
        .write(true)
        .custom_flags(libc::O_SYNC | libc::O_APPEND);
    if create_fresh {
        options.create(true).truncate(true);
    }
    options.mode(0o600).open(file_path)
}

fn write_u16(buffer: &mut Vec<u8>, value: u16) {
    buffer.extend_from_slice(&value.to_le_bytes());
}

fn write_u64(buffer: &mut Vec<u8>, value: u64) {
    buffer.extend_from_slice(&value.to_le_bytes());
}

/// Var-size string: a 7-bits-per-byte little-endian length (continuation bit
/// high) followed by the raw bytes.
fn write_var_size_string(buffer: &mut Vec<u8>, value: &str) {
    let mut size = value.len();
    while size >= 0x80 {
        buffer.push((size as u8 & 0x7F) | 0x80);
        size >>= 7;
    }
    buffer.push(size as u8);
    buffer.extend_from_slice(value.as_bytes());
}

impl Recorder {
    /// Start a brand new log, truncating whatever was there.
    pub fn fresh(file_path: &str) -> io::Result<Recorder> {
        let mut file = open_for_append(file_path, true)?;
        file.write_all(&[VERSION])?;
        Ok(Recorder { file, ent_ids_by_path: HashMap::new() })
    }

    /// Continue appending to an existing log whose entity table was just
    /// read back; `ent_paths` maps each known id to its full local path.
    pub fn resume(file_path: &str, ent_paths: &[String]) -> io::Result<Recorder> {
        let file = open_for_append(file_path, false)?;
        let ent_ids_by_path =
            ent_paths.iter().enumerate().map(|(id, path)| (path.clone(), id as u16)).collect();
        Ok(Recorder { file, ent_ids_by_path })
    }

    pub fn record(&mut self, local_file_path: &str, record: &FileRecord) -> io::Result<()> {
        let mut buffer = Vec::new();
        buffer.push(FILE_UPDATE_TAG);
        write_u64(&mut buffer, record.imprint);
        write_u64(&mut buffer, record.hash);
        let target_id = self.get_path_id(local_file_path)?;
        write_u16(&mut buffer, target_id);
        write_u16(&mut buffer, record.dependency_local_paths.len() as u16);
        for dep_path in &record.dependency_local_paths {
            let dep_id = self.get_path_id(dep_path)?;
            write_u16(&mut buffer, dep_id);
        }
        self.file.write_all(&buffer)
    }

    /// The entity id for `file_path`, emitting `'E'` records for every
    /// unknown `/`-delimited prefix, outermost first.
    fn get_path_id(&mut self, file_path: &str) -> io::Result<u16> {
        let mut parent_ent_id = ROOT_ENT_ID;
        let mut component_start = 0;
        loop {
            let component_end = file_path[component_start..]
                .find('/')
                .map(|ix| component_start + ix)
                .unwrap_or_else(|| file_path.len());
            let prefix = &file_path[..component_end];
            match self.ent_ids_by_path.get(prefix) {
                Some(&ent_id) => parent_ent_id = ent_id,
                None => {
                    let ent_id = self.ent_ids_by_path.len() as u16;
                    let name = &file_path[component_start..component_end];
                    self.record_ent_name(parent_ent_id, name)?;
                    self.ent_ids_by_path.insert(prefix.to_string(), ent_id);
                    parent_ent_id = ent_id;
                }
            }
            if component_end == file_path.len() {
                return Ok(parent_ent_id);
            }
            component_start = component_end + 1;
        }
    }

    fn record_ent_name(&mut self, parent_ent_id: u16, name: &str) -> io::Result<()> {
        let mut buffer = Vec::new();
        buffer.push(ENTITY_NAME_TAG);
        write_u16(&mut buffer, parent_ent_id);
        write_var_size_string(&mut buffer, name);
        self.file.write_all(&buffer)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encodes_var_size_lengths() {
        let mut buffer = Vec::new();
        write_var_size_string(&mut buffer, "abc");
        assert_eq!(buffer, vec![3, b'a', b'b', b'c']);

        let mut buffer = Vec::new();
        write_var_size_string(&mut buffer, &"x".repeat(300));
        // 300 = 0b10_0101100: low 7 bits 0101100 with continuation, then 0b10.
        assert_eq!(buffer[0], 0b1010_1100);
        assert_eq!(buffer[1], 0b0000_0010);
        assert_eq!(buffer.len(), 2 + 300);
    }

    #[test]
    fn interns_each_prefix_once() {
        let temp = tempfile::tempdir().unwrap();
        let log_path = temp.path().join("log").to_string_lossy().into_owned();
        let mut recorder = Recorder::fresh(&log_path).unwrap();
        let record = FileRecord { imprint: 1, hash: 2, dependency_local_paths: vec![] };
        recorder.record("a/b/c.o", &record).unwrap();
        recorder.record("a/b/d.o", &record).unwrap();
        // "a" and "a/b" defined once; ids: a=0, a/b=1, c.o=2, d.o=3.
        assert_eq!(recorder.ent_ids_by_path.len(), 4);
        assert_eq!(recorder.ent_ids_by_path["a/b/d.o"], 3);
    }
}
