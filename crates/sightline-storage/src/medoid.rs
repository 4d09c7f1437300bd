//! Per-class medoid files.
//!
//! Binary layout per medoid record (little-endian):
//!
//! ```text
//! dim: u32
//! ordinal: u8 (1..=3)
//! scale: f32
//! zero: i8 (always 0)
//! payload: i8[dim]
//! digest: [u8; 32]  (Blake2s-256 of payload)
//! ```
//!
//! A class file holds up to three consecutive records and is replaced
//! atomically (write temp + rename). Readers verify every payload digest.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use blake2::{Blake2s256, Digest};
use tracing::debug;

use sightline_core::error::PromotionError;
use sightline_core::quant::QuantizedVec;

/// Cap on medoids per class.
pub const MEDOID_CAP: usize = 3;

/// One decoded medoid record.
#[derive(Debug, Clone, PartialEq)]
pub struct MedoidRecord {
    pub dim: u32,
    pub ordinal: u8,
    pub scale: f32,
    pub zero: i8,
    pub payload: Vec<i8>,
}

impl MedoidRecord {
    /// Reconstruct the float vector.
    pub fn dequantize(&self) -> Vec<f32> {
        QuantizedVec {
            data: self.payload.clone(),
            scale: self.scale,
            zero: self.zero,
        }
        .dequantize()
    }
}

fn payload_digest(payload: &[i8]) -> [u8; 32] {
    let mut hasher = Blake2s256::new();
    // i8 -> u8 reinterpretation is value-preserving for hashing purposes.
    let bytes: Vec<u8> = payload.iter().map(|&b| b as u8).collect();
    hasher.update(&bytes);
    hasher.finalize().into()
}

/// Digest of an entire medoid file, recorded in the promotion ledger.
pub fn file_digest(path: &Path) -> Result<String, PromotionError> {
    let mut file = File::open(path).map_err(|e| PromotionError::io("opening medoid file", e))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .map_err(|e| PromotionError::io("reading medoid file", e))?;
    let mut hasher = Blake2s256::new();
    hasher.update(&bytes);
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

/// Write a class's medoids atomically. Returns the file digest.
pub fn write_class_medoids(
    path: &Path,
    medoids: &[QuantizedVec],
) -> Result<String, PromotionError> {
    debug_assert!(medoids.len() <= MEDOID_CAP);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PromotionError::io("creating medoid directory", e))?;
        }
    }

    let mut buf: Vec<u8> = Vec::new();
    for (i, m) in medoids.iter().enumerate() {
        buf.extend_from_slice(&(m.data.len() as u32).to_le_bytes());
        buf.push((i + 1) as u8);
        buf.extend_from_slice(&m.scale.to_le_bytes());
        buf.push(m.zero as u8);
        buf.extend(m.data.iter().map(|&b| b as u8));
        buf.extend_from_slice(&payload_digest(&m.data));
    }

    let tmp = tmp_path(path);
    {
        let mut file =
            File::create(&tmp).map_err(|e| PromotionError::io("creating medoid temp file", e))?;
        file.write_all(&buf)
            .map_err(|e| PromotionError::io("writing medoid records", e))?;
        file.sync_all()
            .map_err(|e| PromotionError::io("syncing medoid temp file", e))?;
    }
    std::fs::rename(&tmp, path)
        .map_err(|e| PromotionError::io("renaming medoid file into place", e))?;

    debug!(path = %path.display(), medoids = medoids.len(), "medoid file written");
    file_digest(path)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Read and verify a class medoid file.
pub fn read_class_medoids(path: &Path) -> Result<Vec<MedoidRecord>, PromotionError> {
    let mut file = File::open(path).map_err(|e| PromotionError::io("opening medoid file", e))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .map_err(|e| PromotionError::io("reading medoid file", e))?;

    let corrupt = |reason: &str| PromotionError::CorruptFile {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        if pos + 10 > bytes.len() {
            return Err(corrupt("truncated record header"));
        }
        let dim = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap_or([0; 4])) as usize;
        let ordinal = bytes[pos + 4];
        let scale = f32::from_le_bytes(bytes[pos + 5..pos + 9].try_into().unwrap_or([0; 4]));
        let zero = bytes[pos + 9] as i8;
        pos += 10;

        if pos + dim + 32 > bytes.len() {
            return Err(corrupt("truncated payload"));
        }
        let payload: Vec<i8> = bytes[pos..pos + dim].iter().map(|&b| b as i8).collect();
        pos += dim;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes[pos..pos + 32]);
        pos += 32;

        if payload_digest(&payload) != digest {
            return Err(PromotionError::BadDigest {
                path: path.to_path_buf(),
            });
        }
        if ordinal == 0 || ordinal as usize > MEDOID_CAP {
            return Err(corrupt("ordinal out of range"));
        }
        records.push(MedoidRecord {
            dim: dim as u32,
            ordinal,
            scale,
            zero,
            payload,
        });
    }
    if records.len() > MEDOID_CAP {
        return Err(corrupt("more than three medoids"));
    }
    Ok(records)
}
