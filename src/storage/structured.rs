//! Checksummed structured file I/O.
//!
//! Every index file written by Quire is framed the same way:
//!
//! ```text
//! Header  = magic:u32, codec:string, version:i32
//! ...payload...
//! Footer  = !magic:u32, algorithm:u32 (0 = CRC32), checksum:u64
//! ```
//!
//! The checksum covers every byte before it, footer magic and algorithm id
//! included. A file without a valid footer is never trusted, which is what
//! makes a torn write after a crash detectable.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::{QuireError, Result};
use crate::storage::{StorageInput, StorageOutput};
use crate::util::varint::{decode_u64, encode_u64};

/// Magic number opening every file header.
pub const CODEC_MAGIC: u32 = 0x3FD7_6C17;

/// Magic number opening every footer.
pub const FOOTER_MAGIC: u32 = !CODEC_MAGIC;

/// Checksum algorithm id stored in the footer (CRC32).
pub const CHECKSUM_ALGORITHM: u32 = 0;

/// Length of the footer in bytes.
pub const FOOTER_LENGTH: u64 = 16;

/// A structured file writer with a rolling CRC32.
pub struct StructWriter<W: StorageOutput> {
    writer: W,
    hasher: Hasher,
    position: u64,
}

impl<W: StorageOutput> std::fmt::Debug for StructWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructWriter")
            .field("writer", &self.writer)
            .field("position", &self.position)
            .finish()
    }
}

impl<W: StorageOutput> StructWriter<W> {
    /// Create a new structured file writer.
    pub fn new(writer: W) -> Self {
        StructWriter {
            writer,
            hasher: Hasher::new(),
            position: 0,
        }
    }

    /// Write a u8 value.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.writer.write_u8(value)?;
        self.update_checksum(&[value]);
        Ok(())
    }

    /// Write a u32 value (little-endian).
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.writer.write_u32::<LittleEndian>(value)?;
        self.update_checksum(&value.to_le_bytes());
        Ok(())
    }

    /// Write an i32 value (little-endian).
    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.writer.write_i32::<LittleEndian>(value)?;
        self.update_checksum(&value.to_le_bytes());
        Ok(())
    }

    /// Write a u64 value (little-endian).
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.writer.write_u64::<LittleEndian>(value)?;
        self.update_checksum(&value.to_le_bytes());
        Ok(())
    }

    /// Write an i64 value (little-endian).
    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.writer.write_i64::<LittleEndian>(value)?;
        self.update_checksum(&value.to_le_bytes());
        Ok(())
    }

    /// Write a variable-length integer.
    pub fn write_varint(&mut self, value: u64) -> Result<()> {
        let encoded = encode_u64(value);
        self.write_raw(&encoded)
    }

    /// Write a string with length prefix.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Write raw bytes with length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_varint(value.len() as u64)?;
        self.write_raw(value)
    }

    /// Write raw bytes without length prefix.
    pub fn write_raw(&mut self, value: &[u8]) -> Result<()> {
        self.writer.write_all(value)?;
        self.update_checksum(value);
        Ok(())
    }

    /// Write a set of strings in sorted order.
    pub fn write_string_set(&mut self, set: &BTreeSet<String>) -> Result<()> {
        self.write_varint(set.len() as u64)?;
        for value in set {
            self.write_string(value)?;
        }
        Ok(())
    }

    /// Write a string-to-string map in key order.
    pub fn write_string_map(&mut self, map: &BTreeMap<String, String>) -> Result<()> {
        self.write_varint(map.len() as u64)?;
        for (key, value) in map {
            self.write_string(key)?;
            self.write_string(value)?;
        }
        Ok(())
    }

    /// Write the codec header.
    pub fn write_header(&mut self, codec: &str, version: i32) -> Result<()> {
        self.write_u32(CODEC_MAGIC)?;
        self.write_string(codec)?;
        self.write_i32(version)
    }

    /// Write the footer. Nothing may be written after it.
    pub fn write_footer(&mut self) -> Result<()> {
        self.write_u32(FOOTER_MAGIC)?;
        self.write_u32(CHECKSUM_ALGORITHM)?;
        let checksum = self.checksum() as u64;
        self.writer.write_u64::<LittleEndian>(checksum)?;
        self.position += 8;
        Ok(())
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// CRC32 of everything written so far.
    pub fn checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    fn update_checksum(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.position += data.len() as u64;
    }

    /// Flush, sync and close the underlying output.
    pub fn close(mut self) -> Result<()> {
        self.writer.flush_and_sync()?;
        self.writer.close()
    }
}

/// A structured file reader for files written by [`StructWriter`].
///
/// Short reads are reported as [`QuireError::CorruptIndex`]: a file that ends
/// early was torn or truncated.
pub struct StructReader<R: StorageInput> {
    reader: R,
    hasher: Hasher,
    position: u64,
    file_size: u64,
}

impl<R: StorageInput> std::fmt::Debug for StructReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructReader")
            .field("position", &self.position)
            .field("file_size", &self.file_size)
            .finish()
    }
}

impl<R: StorageInput> StructReader<R> {
    /// Create a new structured file reader.
    pub fn new(reader: R) -> Result<Self> {
        let file_size = reader.size()?;
        Ok(StructReader {
            reader,
            hasher: Hasher::new(),
            position: 0,
            file_size,
        })
    }

    fn read_unhashed(&mut self, length: usize) -> Result<Vec<u8>> {
        if self.position + length as u64 > self.file_size {
            return Err(QuireError::corrupt(format!(
                "read past EOF: wanted {length} bytes at {} of {}",
                self.position, self.file_size
            )));
        }
        let mut bytes = vec![0u8; length];
        self.reader.read_exact(&mut bytes).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                QuireError::corrupt(format!("truncated file: {e}"))
            } else {
                QuireError::Io(e)
            }
        })?;
        self.position += length as u64;
        Ok(bytes)
    }

    /// Read exact number of raw bytes.
    pub fn read_raw(&mut self, length: usize) -> Result<Vec<u8>> {
        let bytes = self.read_unhashed(length)?;
        self.hasher.update(&bytes);
        Ok(bytes)
    }

    /// Read a u8 value.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_raw(1)?[0])
    }

    /// Read a u32 value (little-endian).
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(&self.read_raw(4)?))
    }

    /// Read an i32 value (little-endian).
    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(LittleEndian::read_i32(&self.read_raw(4)?))
    }

    /// Read a u64 value (little-endian).
    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(&self.read_raw(8)?))
    }

    /// Read an i64 value (little-endian).
    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(LittleEndian::read_i64(&self.read_raw(8)?))
    }

    /// Read a variable-length integer.
    pub fn read_varint(&mut self) -> Result<u64> {
        let mut bytes = Vec::with_capacity(4);
        loop {
            let byte = self.read_u8()?;
            bytes.push(byte);
            if byte & 0x80 == 0 {
                break;
            }
            if bytes.len() > 10 {
                return Err(QuireError::corrupt("varint longer than 10 bytes"));
            }
        }

        let (value, _) = decode_u64(&bytes)?;
        Ok(value)
    }

    fn read_length(&mut self) -> Result<usize> {
        let length = self.read_varint()?;
        if length > self.remaining() {
            return Err(QuireError::corrupt(format!(
                "length {length} exceeds the {} remaining bytes",
                self.remaining()
            )));
        }
        Ok(length as usize)
    }

    /// Read a string with length prefix.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| QuireError::corrupt(format!("Invalid UTF-8: {e}")))
    }

    /// Read bytes with length prefix.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.read_length()?;
        self.read_raw(length)
    }

    /// Read a set written by [`StructWriter::write_string_set`].
    pub fn read_string_set(&mut self) -> Result<BTreeSet<String>> {
        let count = self.read_length()?;
        let mut set = BTreeSet::new();
        for _ in 0..count {
            set.insert(self.read_string()?);
        }
        Ok(set)
    }

    /// Read a map written by [`StructWriter::write_string_map`].
    pub fn read_string_map(&mut self) -> Result<BTreeMap<String, String>> {
        let count = self.read_length()?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let key = self.read_string()?;
            let value = self.read_string()?;
            map.insert(key, value);
        }
        Ok(map)
    }

    /// Validate the header and return the stored version.
    pub fn check_header(&mut self, codec: &str, min_version: i32, max_version: i32) -> Result<i32> {
        let magic = self.read_u32()?;
        if magic != CODEC_MAGIC {
            return Err(QuireError::corrupt(format!(
                "codec header mismatch: actual magic {magic:#x} vs expected {CODEC_MAGIC:#x}"
            )));
        }

        let actual = self.read_string()?;
        if actual != codec {
            return Err(QuireError::corrupt(format!(
                "codec mismatch: actual codec {actual} vs expected codec {codec}"
            )));
        }

        let version = self.read_i32()?;
        if version < min_version || version > max_version {
            return Err(QuireError::corrupt(format!(
                "version {version} is not in the supported range {min_version}..={max_version}"
            )));
        }
        Ok(version)
    }

    /// Validate the footer. The footer must end the file exactly.
    pub fn check_footer(&mut self) -> Result<()> {
        if self.remaining() != FOOTER_LENGTH {
            return Err(QuireError::corrupt(format!(
                "expected a {FOOTER_LENGTH}-byte footer, found {} trailing bytes",
                self.remaining()
            )));
        }

        let magic = self.read_u32()?;
        if magic != FOOTER_MAGIC {
            return Err(QuireError::corrupt(format!(
                "codec footer mismatch: actual footer {magic:#x} vs expected {FOOTER_MAGIC:#x}"
            )));
        }

        let algorithm = self.read_u32()?;
        if algorithm != CHECKSUM_ALGORITHM {
            return Err(QuireError::corrupt(format!(
                "unknown checksum algorithm {algorithm}"
            )));
        }

        let expected = self.checksum() as u64;
        let actual = LittleEndian::read_u64(&self.read_unhashed(8)?);
        if actual != expected {
            return Err(QuireError::corrupt(format!(
                "checksum failed: actual {actual:#x} vs expected {expected:#x}"
            )));
        }
        Ok(())
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Get file size.
    pub fn size(&self) -> u64 {
        self.file_size
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> u64 {
        self.file_size.saturating_sub(self.position)
    }

    /// CRC32 of everything read so far.
    pub fn checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Close the reader.
    pub fn close(mut self) -> Result<()> {
        self.reader.close()
    }
}
