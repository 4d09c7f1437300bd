//! LabelBank shard binary format.
//!
//! Layout (little-endian):
//!
//! ```text
//! Magic: "SLBK" (4 bytes)
//! Version: u16
//! Dim: u32
//! Count: u32
//! LabelDictLen: u32, LabelDict: bincode Vec<String> (index = label id)
//! RowLabelIds: Count x u32 (row -> label id)
//! CalibrationLen: u32, Calibration: bincode CalibrationTable
//! StructHash: [u8; 32] (SHA-256, machine-order independent)
//! Padding to a 32-byte boundary
//! VectorSlab: Count x Dim x f32, row-major, contiguous
//! ```
//!
//! The slab is 32-byte aligned so the reader can hand out `&[f32]` views of
//! the mmap directly. Rows are sorted at build time by (label id, raw row
//! bytes), which makes both the struct hash and `topk` row indices stable
//! across rebuild machines.

use std::io::Write;

use sha2::{Digest, Sha256};

use crate::calibration::CalibrationTable;
use crate::error::BankError;

pub const SHARD_MAGIC: [u8; 4] = *b"SLBK";
pub const SHARD_VERSION: u16 = 1;
pub const SLAB_ALIGN: usize = 32;

/// Decoded header sections of a shard file.
#[derive(Debug)]
pub struct ParsedShard {
    pub dim: usize,
    pub count: usize,
    pub labels: Vec<String>,
    pub row_label_ids: Vec<u32>,
    pub calibration: CalibrationTable,
    pub struct_hash: [u8; 32],
    pub slab_offset: usize,
}

/// Structural hash over (dim, count, sorted rows). Stable across machines
/// because the builder fixes the row order before hashing.
pub fn struct_hash(dim: usize, rows: &[(String, Vec<f32>)]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update((dim as u32).to_le_bytes());
    hasher.update((rows.len() as u32).to_le_bytes());
    for (label, vec) in rows {
        hasher.update(label.as_bytes());
        hasher.update([0u8]);
        for x in vec {
            hasher.update(x.to_le_bytes());
        }
    }
    hasher.finalize().into()
}

/// Serialize a full shard into `writer`. Rows must already be sorted and
/// `row_label_ids[i]` must match `rows[i]`.
pub fn write_shard<W: Write>(
    mut writer: W,
    dim: usize,
    rows: &[(String, Vec<f32>)],
    labels: &[String],
    row_label_ids: &[u32],
    calibration: &CalibrationTable,
    hash: &[u8; 32],
) -> Result<(), BankError> {
    let mut header: Vec<u8> = Vec::new();
    header.extend_from_slice(&SHARD_MAGIC);
    header.extend_from_slice(&SHARD_VERSION.to_le_bytes());
    header.extend_from_slice(&(dim as u32).to_le_bytes());
    header.extend_from_slice(&(rows.len() as u32).to_le_bytes());

    let dict = bincode::serialize(labels).map_err(|e| BankError::CorruptShard {
        path: Default::default(),
        reason: format!("label dict encode: {e}"),
    })?;
    header.extend_from_slice(&(dict.len() as u32).to_le_bytes());
    header.extend_from_slice(&dict);

    for id in row_label_ids {
        header.extend_from_slice(&id.to_le_bytes());
    }

    let calib = bincode::serialize(calibration).map_err(|e| BankError::CorruptShard {
        path: Default::default(),
        reason: format!("calibration encode: {e}"),
    })?;
    header.extend_from_slice(&(calib.len() as u32).to_le_bytes());
    header.extend_from_slice(&calib);

    header.extend_from_slice(hash);

    let pad = (SLAB_ALIGN - header.len() % SLAB_ALIGN) % SLAB_ALIGN;
    header.extend(std::iter::repeat(0u8).take(pad));

    writer
        .write_all(&header)
        .map_err(|e| BankError::io("writing shard header", e))?;
    for (_, vec) in rows {
        for x in vec {
            writer
                .write_all(&x.to_le_bytes())
                .map_err(|e| BankError::io("writing shard slab", e))?;
        }
    }
    writer
        .flush()
        .map_err(|e| BankError::io("flushing shard", e))?;
    Ok(())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    path: &'a std::path::Path,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], BankError> {
        if self.pos + n > self.bytes.len() {
            return Err(BankError::CorruptShard {
                path: self.path.to_path_buf(),
                reason: format!("truncated at offset {}", self.pos),
            });
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, BankError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, BankError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Parse header sections from the raw (mmap'd) file bytes.
pub fn parse_shard(bytes: &[u8], path: &std::path::Path) -> Result<ParsedShard, BankError> {
    let mut cur = Cursor {
        bytes,
        pos: 0,
        path,
    };

    let magic = cur.take(4)?;
    if magic != SHARD_MAGIC {
        return Err(BankError::CorruptShard {
            path: path.to_path_buf(),
            reason: "bad magic".to_string(),
        });
    }
    let version = cur.u16()?;
    if version != SHARD_VERSION {
        return Err(BankError::CorruptShard {
            path: path.to_path_buf(),
            reason: format!("unsupported version {version}"),
        });
    }
    let dim = cur.u32()? as usize;
    let count = cur.u32()? as usize;
    if count == 0 {
        return Err(BankError::EmptyShard);
    }
    if dim == 0 {
        return Err(BankError::CorruptShard {
            path: path.to_path_buf(),
            reason: "zero dim".to_string(),
        });
    }

    let dict_len = cur.u32()? as usize;
    let labels: Vec<String> =
        bincode::deserialize(cur.take(dict_len)?).map_err(|e| BankError::CorruptShard {
            path: path.to_path_buf(),
            reason: format!("label dict decode: {e}"),
        })?;

    let mut row_label_ids = Vec::with_capacity(count);
    for _ in 0..count {
        let id = cur.u32()?;
        if id as usize >= labels.len() {
            return Err(BankError::CorruptShard {
                path: path.to_path_buf(),
                reason: format!("row label id {id} out of range"),
            });
        }
        row_label_ids.push(id);
    }

    let calib_len = cur.u32()? as usize;
    let calibration: CalibrationTable =
        bincode::deserialize(cur.take(calib_len)?).map_err(|e| BankError::CorruptShard {
            path: path.to_path_buf(),
            reason: format!("calibration decode: {e}"),
        })?;

    let mut struct_hash = [0u8; 32];
    struct_hash.copy_from_slice(cur.take(32)?);

    let pad = (SLAB_ALIGN - cur.pos % SLAB_ALIGN) % SLAB_ALIGN;
    cur.take(pad)?;
    let slab_offset = cur.pos;

    let expected = slab_offset + count * dim * std::mem::size_of::<f32>();
    if bytes.len() != expected {
        return Err(BankError::CorruptShard {
            path: path.to_path_buf(),
            reason: format!("slab size mismatch: file {} vs expected {expected}", bytes.len()),
        });
    }

    Ok(ParsedShard {
        dim,
        count,
        labels,
        row_label_ids,
        calibration,
        struct_hash,
        slab_offset,
    })
}

/// Hex rendering for digests in logs and metadata.
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
