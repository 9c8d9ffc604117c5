//! Firmware images and their on-wire partitioning.
//!
//! An image is padded to the MRAM write granularity, split into segments of
//! at most [`MAX_SEGMENT_SIZE`] bytes (one BURN_MRAM window each), and every
//! segment is streamed as sequenced chunks of [`DATA_PER_CHUNK`] bytes.

pub mod firmware_table;

use std::{fs, io, path::Path};

use crate::error::{Error, Result};
pub use crate::protocol::isp::DATA_PER_CHUNK;

/// MRAM write granularity in bytes.
pub const WRITE_ALIGNMENT: usize = 16;

/// Largest BURN_MRAM window. A USB drop costs at most one segment of resend.
pub const MAX_SEGMENT_SIZE: usize = 256 * 1024;

/// A binary destined for one MRAM address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    name: String,
    address: u32,
    data: Vec<u8>,
}

impl ImageDescriptor {
    /// Build a descriptor. The padded image must fit below 4 GiB.
    pub fn new(name: impl Into<String>, address: u32, data: Vec<u8>) -> Result<Self> {
        let name = name.into();
        let fits = u32::try_from(padded_len(data.len()))
            .ok()
            .and_then(|len| address.checked_add(len))
            .is_some();
        if !fits {
            return Err(Error::Config(format!(
                "{name} ({} bytes) does not fit at 0x{address:08X}",
                data.len()
            )));
        }
        Ok(Self {
            name,
            address,
            data,
        })
    }

    /// Load a binary from disk; the file name becomes the image name.
    pub fn from_file(path: impl AsRef<Path>, address: u32) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::MissingImage(path.to_path_buf()),
            _ => Error::Io(e),
        })?;
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        Self::new(name, address, data)
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Destination address.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Unpadded contents.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Unpadded size.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the image is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size once padded to [`WRITE_ALIGNMENT`].
    pub fn padded_len(&self) -> usize {
        padded_len(self.data.len())
    }

    /// Contents padded with zeros to [`WRITE_ALIGNMENT`].
    pub fn padded(&self) -> Vec<u8> {
        pad_image(&self.data)
    }
}

/// Smallest multiple of [`WRITE_ALIGNMENT`] not below `len`.
pub fn padded_len(len: usize) -> usize {
    len.div_ceil(WRITE_ALIGNMENT) * WRITE_ALIGNMENT
}

/// Copy `data` and append zeros up to the next multiple of [`WRITE_ALIGNMENT`].
pub fn pad_image(data: &[u8]) -> Vec<u8> {
    let mut padded = Vec::with_capacity(padded_len(data.len()));
    padded.extend_from_slice(data);
    padded.resize(padded_len(data.len()), 0);
    padded
}

/// One BURN_MRAM window of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    /// Zero-based position within the image.
    pub index: usize,
    /// MRAM address of the first byte.
    pub address: u32,
    /// Offset of the first byte within the image.
    pub offset: usize,
    /// Segment contents.
    pub data: &'a [u8],
}

impl<'a> Segment<'a> {
    /// Size in bytes as sent in BURN_MRAM.
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_SEGMENT_SIZE
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Number of DOWNLOAD_DATA frames needed.
    pub fn chunk_count(&self) -> usize {
        self.data
            .len()
            .div_ceil(DATA_PER_CHUNK)
    }

    /// Sequenced chunks, numbered from zero within this segment.
    #[allow(clippy::cast_possible_truncation)] // wraps only past 65536 chunks
    pub fn chunks(self) -> impl Iterator<Item = Chunk<'a>> {
        self.data
            .chunks(DATA_PER_CHUNK)
            .enumerate()
            .map(|(i, data)| Chunk {
                sequence: i as u16,
                data,
            })
    }
}

/// One DOWNLOAD_DATA payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    /// Sequence number within the segment.
    pub sequence: u16,
    /// Chunk contents.
    pub data: &'a [u8],
}

/// Split `data` into segments of at most [`MAX_SEGMENT_SIZE`] starting at `base`.
///
/// The caller guarantees `base + data.len()` fits in 32 bits, as
/// [`ImageDescriptor::new`] does.
#[allow(clippy::cast_possible_truncation)] // range checked by ImageDescriptor
pub fn segments(data: &[u8], base: u32) -> impl Iterator<Item = Segment<'_>> {
    data.chunks(MAX_SEGMENT_SIZE)
        .enumerate()
        .map(move |(index, data)| {
            let offset = index * MAX_SEGMENT_SIZE;
            Segment {
                index,
                address: base.wrapping_add(offset as u32),
                offset,
                data,
            }
        })
}
