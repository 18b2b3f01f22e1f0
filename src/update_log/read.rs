//! Streaming reader for the update log.

use std::io::{self, Read};

use thiserror::Error;

use super::{FileRecord, RecordsByFile, ENTITY_NAME_TAG, FILE_UPDATE_TAG, ROOT_ENT_ID, VERSION};

/// Everything recovered from an existing log file: the records themselves,
/// plus the entity table so that appending can keep interning paths.
#[derive(Debug, Default)]
pub struct CacheFileData {
    pub records: RecordsByFile,
    pub ent_paths: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ReadError {
    /// The log was written by another version of the tool; it is simply
    /// discarded, this is not fatal.
    #[error("update log version mismatch")]
    VersionMismatch,
    /// Truncated record, unknown record tag, or dangling entity id.
    #[error("unexpected data in the update log")]
    Corruption,
    #[error(transparent)]
    Io(io::Error),
}

fn read_byte<R: Read>(reader: &mut R) -> Result<Option<u8>, ReadError> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(ref error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(ReadError::Io(error)),
        }
    }
}

fn read_exact<R: Read>(reader: &mut R, buffer: &mut [u8]) -> Result<(), ReadError> {
    match reader.read_exact(buffer) {
        Ok(()) => Ok(()),
        Err(ref error) if error.kind() == io::ErrorKind::UnexpectedEof => {
            Err(ReadError::Corruption)
        }
        Err(error) => Err(ReadError::Io(error)),
    }
}

fn read_u16<R: Read>(reader: &mut R) -> Result<u16, ReadError> {
    let mut bytes = [0u8; 2];
    read_exact(reader, &mut bytes)?;
    Ok(u16::from_le_bytes(bytes))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, ReadError> {
    let mut bytes = [0u8; 8];
    read_exact(reader, &mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

fn read_var_size<R: Read>(reader: &mut R) -> Result<usize, ReadError> {
    let mut size: usize = 0;
    let mut shift = 0;
    loop {
        let byte = read_byte(reader)?.ok_or(ReadError::Corruption)?;
        size |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok(size);
        }
        shift += 7;
        if shift > 63 {
            return Err(ReadError::Corruption);
        }
    }
}

fn read_var_size_string<R: Read>(reader: &mut R) -> Result<String, ReadError> {
    let size = read_var_size(reader)?;
    let mut bytes = vec![0u8; size];
    read_exact(reader, &mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn ent_path(ent_paths: &[String], ent_id: u16) -> Result<String, ReadError> {
    ent_paths.get(ent_id as usize).cloned().ok_or(ReadError::Corruption)
}

/// Stream the whole log. A clean end-of-file is only valid at a record
/// boundary; anything shorter is corruption.
pub fn read_log<R: Read>(reader: &mut R) -> Result<CacheFileData, ReadError> {
    let version = read_byte(reader)?.ok_or(ReadError::Corruption)?;
    if version != VERSION {
        return Err(ReadError::VersionMismatch);
    }
    let mut data = CacheFileData::default();
    while let Some(tag) = read_byte(reader)? {
        match tag {
            FILE_UPDATE_TAG => {
                let imprint = read_u64(reader)?;
                let hash = read_u64(reader)?;
                let file_path = ent_path(&data.ent_paths, read_u16(reader)?)?;
                let dep_count = read_u16(reader)?;
                let mut dependency_local_paths = Vec::with_capacity(dep_count as usize);
                for _ in 0..dep_count {
                    dependency_local_paths.push(ent_path(&data.ent_paths, read_u16(reader)?)?);
                }
                data.records
                    .insert(file_path, FileRecord { imprint, hash, dependency_local_paths });
            }
            ENTITY_NAME_TAG => {
                let parent_ent_id = read_u16(reader)?;
                let name = read_var_size_string(reader)?;
                let path = if parent_ent_id == ROOT_ENT_ID {
                    name
                } else {
                    format!("{}/{}", ent_path(&data.ent_paths, parent_ent_id)?, name)
                };
                data.ent_paths.push(path);
            }
            _ => return Err(ReadError::Corruption),
        }
    }
    Ok(data)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reads_an_empty_versioned_log() {
        let data = read_log(&mut &[VERSION][..]).unwrap();
        assert!(data.records.is_empty());
        assert!(data.ent_paths.is_empty());
    }

    #[test]
    fn rejects_unknown_versions() {
        match read_log(&mut &[3u8, b'E'][..]) {
            Err(ReadError::VersionMismatch) => {}
            _ => panic!("expected a version mismatch"),
        }
    }

    #[test]
    fn rejects_unknown_tags() {
        match read_log(&mut &[VERSION, b'Z'][..]) {
            Err(ReadError::Corruption) => {}
            _ => panic!("expected corruption"),
        }
    }

    #[test]
    fn rejects_dangling_entity_ids() {
        // 'U' record referring to entity 7 with no entity table.
        let mut bytes = vec![VERSION, b'U'];
        bytes.extend_from_slice(&[0; 16]);
        bytes.extend_from_slice(&7u16.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        match read_log(&mut &bytes[..]) {
            Err(ReadError::Corruption) => {}
            _ => panic!("expected corruption"),
        }
    }

    #[test]
    fn reconstructs_nested_entity_paths() {
        let mut bytes = vec![VERSION];
        bytes.push(b'E');
        bytes.extend_from_slice(&ROOT_ENT_ID.to_le_bytes());
        bytes.extend_from_slice(&[3, b'd', b'i', b'r']);
        bytes.push(b'E');
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&[3, b'f', b'.', b'o']);
        let data = read_log(&mut &bytes[..]).unwrap();
        assert_eq!(data.ent_paths, vec!["dir".to_string(), "dir/f.o".to_string()]);
    }
}
