//! Motorola S-record and Intel-HEX decoding
//!
//! Both formats are decoded in two passes over the text. The first pass checks
//! every record and finds the address extent, the second copies payloads into a
//! zero-filled buffer covering that extent.

use std::convert::TryFrom;
use std::fmt;
use std::path::Path;

use thiserror::Error;

use crate::checksum::{hex_line_checksum, s19_line_checksum};
use crate::protocol::range_fits;

/// Largest image the decoder will allocate
pub const MAX_IMAGE_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Clone, PartialEq, Debug, Error)]
pub enum HexError {
    #[error("line {line}: wrong checksum (read 0x{read:02x}, computed 0x{computed:02x})")]
    ChecksumMismatch { line: usize, read: u8, computed: u8 },

    #[error("line {line}: {reason}")]
    MalformedRecord { line: usize, reason: Malformed },

    #[error("unsupported file format '{0}', expected .s19, .hex or .ihx")]
    UnsupportedFileFormat(String),

    #[error("image spans {size} bytes, more than the {max} byte limit")]
    ImageTooLarge { size: u64, max: u64 },
}

/// Why a record could not be parsed
#[derive(Clone, Copy, PartialEq, Debug, Error)]
pub enum Malformed {
    #[error("record does not start with '{0}'")]
    BadStart(char),
    #[error("invalid hex digit")]
    InvalidDigit,
    #[error("record shorter than its declared length")]
    Truncated,
    #[error("unexpected characters after checksum")]
    Trailing,
    #[error("unsupported record type {0}")]
    UnsupportedType(u8),
    #[error("declared length too short for record type")]
    LengthTooShort,
    #[error("extended address record must carry two bytes")]
    ExtendedAddressLength,
    #[error("record extends past the 32-bit address space")]
    AddressOverflow,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Format {
    /// Motorola S-record (S19/S28/S37 records)
    S19,
    /// Intel-HEX with extended linear addressing
    IntelHex,
}

impl Format {
    /// Select a format from a file name extension (`.s19`, `.hex`, `.ihx`)
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, HexError> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match ext.as_deref() {
            Some("s19") => Ok(Format::S19),
            Some("hex") | Some("ihx") => Ok(Format::IntelHex),
            _ => Err(HexError::UnsupportedFileFormat(path.display().to_string())),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::S19 => write!(f, "s19"),
            Format::IntelHex => write!(f, "intel hex"),
        }
    }
}

/// A contiguous memory image and the address of its first byte
#[derive(Clone, PartialEq, Debug, Default)]
pub struct MemoryImage {
    base: u32,
    data: Vec<u8>,
}

impl MemoryImage {
    pub fn new(base: u32, data: Vec<u8>) -> Self {
        Self { base, data }
    }

    pub fn base_address(&self) -> u32 {
        self.base
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Address of the last byte, `None` for an empty image or one that runs
    /// past the 32-bit address space
    pub fn end_address(&self) -> Option<u32> {
        match self.data.len() {
            0 => None,
            n => u32::try_from(n - 1).ok().and_then(|last| self.base.checked_add(last)),
        }
    }
}

/// Decode a text buffer into a memory image.
///
/// Gaps between records are zero-filled. A buffer without data records yields
/// an empty image at address 0.
pub fn decode(text: &str, format: Format) -> Result<MemoryImage, HexError> {
    // 1st pass: check syntax and find the address extent
    let mut extent: Option<(u32, u32)> = None;
    scan(text, format, |address, data| {
        let last = address + (data.len() as u32 - 1);
        extent = Some(match extent {
            None => (address, last),
            Some((min, max)) => (min.min(address), max.max(last)),
        });
    })?;

    let (min, max) = match extent {
        Some(e) => e,
        None => {
            debug!("{} buffer holds no data records", format);
            return Ok(MemoryImage::default());
        }
    };

    let size = (max - min) as u64 + 1;
    if size > MAX_IMAGE_SIZE {
        return Err(HexError::ImageTooLarge { size, max: MAX_IMAGE_SIZE });
    }

    // 2nd pass: copy payloads into the image
    let mut image = vec![0u8; size as usize];
    scan(text, format, |address, data| {
        let offset = (address - min) as usize;
        image[offset..offset + data.len()].copy_from_slice(data);
    })?;

    debug!("decoded {} bytes of {} @ 0x{:04x}", image.len(), format, min);

    Ok(MemoryImage::new(min, image))
}

enum Record {
    Data { address: u32, data: Vec<u8> },
    /// Upper 16 address bits for following records, already shifted
    ExtendedAddress(u32),
    EndOfFile,
    /// Header, count and termination records
    Skip,
}

/// Walk every record, calling `f` with the absolute address and payload of each
/// non-empty data record.
fn scan<F>(text: &str, format: Format, mut f: F) -> Result<(), HexError>
where
    F: FnMut(u32, &[u8]),
{
    let mut upper = 0u32;

    for (line, record) in lines(text) {
        let record = match format {
            Format::S19 => parse_s19(line, record)?,
            Format::IntelHex => parse_hex(line, record)?,
        };

        match record {
            Record::Data { address, data } => {
                let address = upper | address;
                if !range_fits(address, data.len()) {
                    return Err(HexError::MalformedRecord {
                        line,
                        reason: Malformed::AddressOverflow,
                    });
                }
                if !data.is_empty() {
                    f(address, &data);
                }
            }
            Record::ExtendedAddress(offset) => upper = offset,
            Record::EndOfFile => break,
            Record::Skip => (),
        }
    }

    Ok(())
}

/// Non-empty lines with 1-based numbers. A NUL ends the buffer.
fn lines(text: &str) -> impl Iterator<Item = (usize, &[u8])> {
    let text = text.split('\0').next().unwrap_or("");

    text.as_bytes()
        .split(|c| *c == b'\r' || *c == b'\n')
        .map(trim_end)
        .filter(|l| !l.is_empty())
        .enumerate()
        .map(|(i, l)| (i + 1, l))
}

fn trim_end(mut line: &[u8]) -> &[u8] {
    while let Some((last, rest)) = line.split_last() {
        if !last.is_ascii_whitespace() {
            break;
        }
        line = rest;
    }
    line
}

/// Cursor over the hex-encoded bytes of one record
struct Fields<'a> {
    line: usize,
    text: &'a [u8],
    raw: Vec<u8>,
}

impl<'a> Fields<'a> {
    fn new(line: usize, text: &'a [u8]) -> Self {
        Self { line, text, raw: Vec::with_capacity(text.len() / 2) }
    }

    fn malformed(&self, reason: Malformed) -> HexError {
        HexError::MalformedRecord { line: self.line, reason }
    }

    /// Read the next byte without adding it to the checksummed fields
    fn next_byte(&mut self) -> Result<u8, HexError> {
        if self.text.len() < 2 {
            return Err(self.malformed(Malformed::Truncated));
        }
        let hi = (self.text[0] as char).to_digit(16);
        let lo = (self.text[1] as char).to_digit(16);
        match (hi, lo) {
            (Some(hi), Some(lo)) => {
                self.text = &self.text[2..];
                Ok((hi << 4 | lo) as u8)
            }
            _ => Err(self.malformed(Malformed::InvalidDigit)),
        }
    }

    fn byte(&mut self) -> Result<u8, HexError> {
        let b = self.next_byte()?;
        self.raw.push(b);
        Ok(b)
    }

    fn be(&mut self, width: usize) -> Result<u32, HexError> {
        let mut v = 0u32;
        for _ in 0..width {
            v = v << 8 | self.byte()? as u32;
        }
        Ok(v)
    }

    fn bytes(&mut self, n: usize) -> Result<(), HexError> {
        for _ in 0..n {
            self.byte()?;
        }
        Ok(())
    }

    /// Read the trailing checksum and compare it against `computed(raw fields)`
    fn checksum(&mut self, computed: fn(&[u8]) -> u8) -> Result<(), HexError> {
        let read = self.next_byte()?;
        if !self.text.is_empty() {
            return Err(self.malformed(Malformed::Trailing));
        }

        let computed = computed(&self.raw);
        if read != computed {
            return Err(HexError::ChecksumMismatch { line: self.line, read, computed });
        }
        Ok(())
    }

    /// Payload: the last `n` checksummed bytes
    fn tail(&self, n: usize) -> Vec<u8> {
        self.raw[self.raw.len() - n..].to_vec()
    }
}

fn parse_s19(line: usize, text: &[u8]) -> Result<Record, HexError> {
    let bad = |reason| HexError::MalformedRecord { line, reason };

    if text[0] != b'S' {
        return Err(bad(Malformed::BadStart('S')));
    }
    let kind = match text.get(1) {
        Some(c) => (*c as char).to_digit(10).ok_or(bad(Malformed::InvalidDigit))? as u8,
        None => return Err(bad(Malformed::Truncated)),
    };

    // address width in bytes (S1=16bit, S2=24bit, S3=32bit)
    let width = match kind {
        1 | 2 | 3 => kind as usize + 1,
        0 | 5 | 6 | 7 | 8 | 9 => return Ok(Record::Skip),
        other => return Err(bad(Malformed::UnsupportedType(other))),
    };

    let mut fields = Fields::new(line, &text[2..]);

    // record length covers address, data and checksum
    let count = fields.byte()? as usize;
    if count < width + 1 {
        return Err(bad(Malformed::LengthTooShort));
    }
    let address = fields.be(width)?;
    let len = count - width - 1;
    fields.bytes(len)?;
    fields.checksum(s19_line_checksum)?;

    Ok(Record::Data { address, data: fields.tail(len) })
}

fn parse_hex(line: usize, text: &[u8]) -> Result<Record, HexError> {
    let bad = |reason| HexError::MalformedRecord { line, reason };

    if text[0] != b':' {
        return Err(bad(Malformed::BadStart(':')));
    }

    let mut fields = Fields::new(line, &text[1..]);

    let len = fields.byte()? as usize;
    let address = fields.be(2)?;
    let kind = fields.byte()?;

    match kind {
        0x00 => {
            fields.bytes(len)?;
            fields.checksum(hex_line_checksum)?;
            Ok(Record::Data { address, data: fields.tail(len) })
        }
        0x01 => Ok(Record::EndOfFile),
        0x04 => {
            if len != 2 {
                return Err(bad(Malformed::ExtendedAddressLength));
            }
            let upper = fields.be(2)?;
            fields.checksum(hex_line_checksum)?;
            Ok(Record::ExtendedAddress(upper << 16))
        }
        other => Err(bad(Malformed::UnsupportedType(other))),
    }
}
