//! Length+CRC32-framed append log, in the shape of the teacher's turn log
//! (`turns.log`): each record is `[len:u32 LE][crc32:u32 LE][bytes]`.
//! `replay()` reads every record back in order and truncates a
//! corrupt or partial tail rather than failing to open.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::Result;

pub struct RecordLog {
    path: PathBuf,
    file: File,
}

impl RecordLog {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        let mut log = Self {
            path: path.to_path_buf(),
            file,
        };
        log.truncate_corrupt_tail()?;
        Ok(log)
    }

    /// Walk the file once at open time, truncating at the first corrupt or
    /// incomplete record so future appends land on a clean boundary.
    fn truncate_corrupt_tail(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        loop {
            let start = self.file.stream_position()?;
            match read_one(&mut self.file) {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    self.file.set_len(start)?;
                    break;
                }
            }
        }
        Ok(())
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_u32::<LittleEndian>(bytes.len() as u32)?;
        let mut hasher = Hasher::new();
        hasher.update(bytes);
        self.file.write_u32::<LittleEndian>(hasher.finalize())?;
        self.file.write_all(bytes)?;
        self.file.flush()?;
        Ok(())
    }

    pub fn replay(&self) -> Result<Vec<Vec<u8>>> {
        let mut file = OpenOptions::new().read(true).open(&self.path)?;
        file.seek(SeekFrom::Start(0))?;
        let mut out = Vec::new();
        while let Some(bytes) = read_one(&mut file)? {
            out.push(bytes);
        }
        Ok(out)
    }
}

fn read_one(file: &mut File) -> Result<Option<Vec<u8>>> {
    let len = match file.read_u32::<LittleEndian>() {
        Ok(v) => v as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let crc = file.read_u32::<LittleEndian>()?;
    let mut bytes = vec![0u8; len];
    file.read_exact(&mut bytes)?;

    let mut hasher = Hasher::new();
    hasher.update(&bytes);
    if hasher.finalize() != crc {
        return Err(crate::error::BridgeError::Store("record crc mismatch".into()));
    }
    Ok(Some(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_then_replay_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.log");
        let mut log = RecordLog::open(&path).unwrap();
        log.append(b"hello").unwrap();
        log.append(b"world").unwrap();

        let records = log.replay().unwrap();
        assert_eq!(records, vec![b"hello".to_vec(), b"world".to_vec()]);
    }

    #[test]
    fn truncates_corrupt_tail_on_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.log");
        {
            let mut log = RecordLog::open(&path).unwrap();
            log.append(b"good").unwrap();
        }
        // Append a partial/corrupt record directly.
        {
            use std::io::Write as _;
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }
        let log = RecordLog::open(&path).unwrap();
        let records = log.replay().unwrap();
        assert_eq!(records, vec![b"good".to_vec()]);
    }
}
