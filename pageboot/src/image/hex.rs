//! Hex record codec.
//!
//! One record per line: `:` followed by the hex digits of
//!
//! ```text
//! [count:1][address:2 BE][type:1][data:count][checksum:1]
//! ```
//!
//! The 8-bit sum of every record byte, checksum included, is zero. Only data
//! records (type `0x00`) carry image bytes; every other record type passes the
//! length and checksum checks and is then ignored. Lines without a `:` are
//! skipped.

use {
    super::FirmwareImage,
    crate::error::{Error, Result},
    log::{debug, trace},
    std::io::{self, BufRead, Write},
};

/// Record marker at the start of every line.
pub const RECORD_MARK: char = ':';

/// Data bytes per record on encode.
pub const BYTES_PER_RECORD: usize = 16;

/// Record type of a data record.
pub const DATA_RECORD: u8 = 0x00;

/// The fixed end-of-file record.
pub const EOF_RECORD: &str = ":00000001FF";

/// Count, address and type bytes plus the checksum.
const RECORD_OVERHEAD: usize = 5;

/// Two's complement of the 8-bit sum of `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    0u8.wrapping_sub(bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b)))
}

/// Decode hex text into an image.
///
/// `Ok(None)` means the text holds no data records.
pub fn decode(text: &str) -> Result<Option<FirmwareImage>> {
    decode_reader(text.as_bytes())
}

/// Decode hex records from a buffered reader, one line at a time.
pub fn decode_reader<R: BufRead>(reader: R) -> Result<Option<FirmwareImage>> {
    let mut start_address: Option<u32> = None;
    let mut data = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line_no = index + 1;
        let line = line.map_err(|e| match e.kind() {
            io::ErrorKind::InvalidData => Error::MalformedRecord {
                line: line_no,
                reason: "line is not valid text".into(),
            },
            _ => Error::Io(e),
        })?;
        let Some((_, digits)) = line.split_once(RECORD_MARK) else {
            trace!("Skipping line {line_no}: no record mark");
            continue;
        };

        let record = parse_record(line_no, digits.trim())?;
        let record_type = record[3];
        if record_type != DATA_RECORD {
            debug!("Ignoring record type 0x{record_type:02X} on line {line_no}");
            continue;
        }

        let address = u32::from(u16::from_be_bytes([record[1], record[2]]));
        let payload = &record[4..record.len() - 1];
        let expected = match start_address {
            Some(start) => start + data.len() as u32,
            None => {
                start_address = Some(address);
                address
            },
        };
        if address != expected {
            return Err(Error::AddressDiscontinuity {
                line: line_no,
                expected,
                found: address,
            });
        }
        data.extend_from_slice(payload);
    }

    match start_address {
        Some(start) => Ok(Some(FirmwareImage::new(start, data)?)),
        None => Ok(None),
    }
}

/// Decode and validate one record's hex digits.
fn parse_record(line: usize, digits: &str) -> Result<Vec<u8>> {
    let record = ::hex::decode(digits).map_err(|e| Error::MalformedRecord {
        line,
        reason: e.to_string(),
    })?;

    if record.len() < RECORD_OVERHEAD {
        return Err(Error::MalformedRecord {
            line,
            reason: format!("record is only {} bytes", record.len()),
        });
    }

    let declared = usize::from(record[0]);
    if record.len() != declared + RECORD_OVERHEAD {
        return Err(Error::RecordLengthMismatch {
            line,
            declared,
            actual: record.len(),
        });
    }

    let sum = record.iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
    if sum != 0 {
        return Err(Error::ChecksumError { line, sum });
    }

    Ok(record)
}

/// Write an image as hex records followed by the end-of-file record.
pub fn encode_to<W: Write>(image: &FirmwareImage, writer: &mut W) -> Result<()> {
    for (i, chunk) in image.data().chunks(BYTES_PER_RECORD).enumerate() {
        // FirmwareImage keeps every address below 0x10000
        let address = (image.start_address() as usize + i * BYTES_PER_RECORD) as u16;
        let mut record = Vec::with_capacity(chunk.len() + RECORD_OVERHEAD);
        record.push(chunk.len() as u8);
        record.extend_from_slice(&address.to_be_bytes());
        record.push(DATA_RECORD);
        record.extend_from_slice(chunk);
        record.push(checksum(&record));

        writeln!(writer, "{RECORD_MARK}{}", ::hex::encode_upper(&record))?;
    }
    writeln!(writer, "{EOF_RECORD}")?;
    Ok(())
}

/// Encode an image as hex text.
pub fn encode(image: &FirmwareImage) -> String {
    let mut out = Vec::new();
    // Writing to a Vec<u8> cannot fail
    let _ = encode_to(image, &mut out);
    String::from_utf8_lossy(&out).into_owned()
}
