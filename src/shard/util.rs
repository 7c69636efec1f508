//! Utility functions for shard topology files
//!
//! A topology file is a small fixed header followed by a bincode payload:
//!
//! ```text
//! magic (4) | version u32 | payload length u32 | payload crc32 u32 | payload
//! ```
//!
//! All integers are little-endian. Writers hold an exclusive lock on the file
//! while replacing it; readers hold a shared lock.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use fs2::FileExt;

use crate::error::{Result, Error};
use crate::shard::{TOPOLOGY_MAGIC, TOPOLOGY_VERSION};

/// Size of the fixed header in bytes
pub(crate) const HEADER_LEN: usize = 16;

/// Write `payload` to `path` behind a topology header
pub(crate) fn write_framed(path: &Path, payload: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    file.lock_exclusive()?;
    let result = write_locked(&file, payload);
    let unlocked = file.unlock();
    result?;
    unlocked?;

    Ok(())
}

fn write_locked(file: &File, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::topology(format!("topology payload too large: {} bytes", payload.len())))?;

    file.set_len(0)?;
    let mut writer = BufWriter::new(file);

    writer.write_all(TOPOLOGY_MAGIC)?;
    writer.write_u32::<LittleEndian>(TOPOLOGY_VERSION)?;
    writer.write_u32::<LittleEndian>(len)?;
    writer.write_u32::<LittleEndian>(crc32fast::hash(payload))?;
    writer.write_all(payload)?;
    writer.flush()?;

    writer.get_ref().sync_all()?;
    Ok(())
}

/// Read the payload of the topology file at `path`, checking the header
pub(crate) fn read_framed(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            Error::topology(format!("topology file not found: {}", path.display()))
        } else {
            Error::Io(e)
        }
    })?;

    file.lock_shared()?;
    let result = read_locked(&file, path);
    let unlocked = file.unlock();
    let payload = result?;
    unlocked?;

    Ok(payload)
}

fn read_locked(file: &File, path: &Path) -> Result<Vec<u8>> {
    let mut reader = BufReader::new(file);

    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).map_err(|e| truncated(path, e))?;

    let (magic, mut fields) = header.split_at(TOPOLOGY_MAGIC.len());
    if magic != TOPOLOGY_MAGIC {
        return Err(Error::corruption(format!(
            "{}: invalid topology file header: {:?}", path.display(), magic
        )));
    }

    let version = fields.read_u32::<LittleEndian>()?;
    if version != TOPOLOGY_VERSION {
        return Err(Error::corruption(format!(
            "{}: unsupported topology version: {}", path.display(), version
        )));
    }

    let len = fields.read_u32::<LittleEndian>()? as usize;
    let expected_crc = fields.read_u32::<LittleEndian>()?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(|e| truncated(path, e))?;

    let actual_crc = crc32fast::hash(&payload);
    if actual_crc != expected_crc {
        return Err(Error::corruption(format!(
            "{}: checksum mismatch (expected {:08x}, found {:08x})",
            path.display(), expected_crc, actual_crc
        )));
    }

    Ok(payload)
}

fn truncated(path: &Path, e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::corruption(format!("{}: truncated topology file", path.display()))
    } else {
        Error::Io(e)
    }
}
