//! OTA image packing
//!
//! The peripheral expects the first bytes of a transfer to be a metadata
//! block describing the image, followed by the code itself:
//!
//! ```text
//! entrypoint: u16   offset of the entry function inside the image
//! size:       u16   length of the code that follows the metadata
//! loads[3]:   { dest: u32, offset: u16, len: u16 }   zero-filled if unused
//! ```
//!
//! Images usually come from the ELF extractor, which emits JSON with the
//! code as a hex string.

use serde::{Deserialize, Serialize};

use crate::error::{OtaError, Result};

/// The peripheral reserves room for exactly this many load descriptors.
pub const MAX_LOADS: usize = 3;

const LOAD_LEN: usize = 8;

/// Length of the metadata block in front of the code.
pub const METADATA_LEN: usize = 4 + MAX_LOADS * LOAD_LEN;

/// A region copied from the image into RAM before the entrypoint runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSegment {
    pub dest: u32,
    pub offset: u16,
    pub len: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaImage {
    pub entrypoint: u16,
    pub code: Vec<u8>,
    pub loads: Vec<LoadSegment>,
}

/// Shape of the extractor's JSON output.
#[derive(Debug, Deserialize)]
struct ExtractedImage {
    entrypoint: u64,
    data: String,
    #[serde(default)]
    loads: Vec<ExtractedLoad>,
}

#[derive(Debug, Deserialize)]
struct ExtractedLoad {
    dest: u64,
    offset: u64,
    len: u64,
}

fn narrow<T: TryFrom<u64>>(value: u64, field: &str) -> Result<T> {
    T::try_from(value).map_err(|_| OtaError::Image(format!("{} {:#x} out of range", field, value)))
}

impl OtaImage {
    pub fn new(entrypoint: u16, code: Vec<u8>) -> Self {
        Self {
            entrypoint,
            code,
            loads: Vec::new(),
        }
    }

    pub fn with_load(mut self, load: LoadSegment) -> Self {
        self.loads.push(load);
        self
    }

    /// Parse the JSON emitted by the ELF extractor.
    pub fn from_json(json: &str) -> Result<Self> {
        let extracted: ExtractedImage = serde_json::from_str(json)?;
        let code = hex::decode(extracted.data.trim())
            .map_err(|e| OtaError::Image(format!("invalid hex data: {}", e)))?;
        let loads = extracted
            .loads
            .iter()
            .map(|l| {
                Ok(LoadSegment {
                    dest: narrow(l.dest, "load dest")?,
                    offset: narrow(l.offset, "load offset")?,
                    len: narrow(l.len, "load len")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            entrypoint: narrow(extracted.entrypoint, "entrypoint")?,
            code,
            loads,
        })
    }

    /// Metadata block followed by the code, ready to be split into frames.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        if self.loads.len() > MAX_LOADS {
            return Err(OtaError::Image(format!(
                "{} load segments, at most {} supported",
                self.loads.len(),
                MAX_LOADS
            )));
        }
        let size = u16::try_from(self.code.len()).map_err(|_| {
            OtaError::Image(format!("code is {} bytes, at most 65535 supported", self.code.len()))
        })?;

        let mut out = Vec::with_capacity(METADATA_LEN + self.code.len());
        out.extend_from_slice(&self.entrypoint.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        for i in 0..MAX_LOADS {
            let load = self.loads.get(i).copied().unwrap_or_default();
            out.extend_from_slice(&load.dest.to_le_bytes());
            out.extend_from_slice(&load.offset.to_le_bytes());
            out.extend_from_slice(&load.len.to_le_bytes());
        }
        out.extend_from_slice(&self.code);
        Ok(out)
    }
}
