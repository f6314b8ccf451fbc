//! Intel-HEX firmware image reader.
//!
//! Parses the textual image produced by the firmware toolchain into a list of
//! records with absolute addresses, and cuts the data into flash pages for the
//! bootloader.
//!
//! Each line has the form `:LLAAAATT<data>CC`:
//! - `LL` - number of data bytes
//! - `AAAA` - 16-bit address, relative to the current base
//! - `TT` - record type (00 data, 01 end of file, 02/04 extended address,
//!   03/05 start address)
//! - `CC` - two's complement of the sum of all preceding bytes

use std::fmt::Write as _;
use std::ops::Range;
use std::path::Path;

use sha2::{Digest, Sha256};

use super::error::{ParseError, UpgradeError};

const RECORD_DATA: u8 = 0x00;
const RECORD_END_OF_FILE: u8 = 0x01;
const RECORD_EXTENDED_SEGMENT_ADDRESS: u8 = 0x02;
const RECORD_START_SEGMENT_ADDRESS: u8 = 0x03;
const RECORD_EXTENDED_LINEAR_ADDRESS: u8 = 0x04;
const RECORD_START_LINEAR_ADDRESS: u8 = 0x05;

/// Shortest valid line: colon, count, address, type and checksum.
const MIN_LINE_LEN: usize = 11;

/// Byte value of erased flash, used to pad partial pages.
pub const ERASED_BYTE: u8 = 0xFF;

/// Kind of an Intel-HEX record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Data,
    EndOfFile,
    ExtendedAddress,
    StartAddress,
}

/// A single record, with its address already resolved.
///
/// For `Data` the address is the absolute address of the first byte, for
/// `ExtendedAddress` it is the new base, for `StartAddress` the entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    pub address: u32,
    pub data: Vec<u8>,
    pub kind: RecordKind,
}

impl HexRecord {
    /// Address range covered by a data record.
    ///
    /// Parsed records always end at or below `u32::MAX`.
    pub fn range(&self) -> Range<u32> {
        self.address..self.address.saturating_add(self.data.len() as u32)
    }
}

/// One flash page ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub address: u32,
    pub data: Vec<u8>,
}

/// A parsed firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    records: Vec<HexRecord>,
}

impl FirmwareImage {
    /// All records, in file order. The last one is always the end-of-file record.
    pub fn records(&self) -> &[HexRecord] {
        &self.records
    }

    /// Iterate over the data records only.
    pub fn data_records(&self) -> impl Iterator<Item = &HexRecord> {
        self.records.iter().filter(|r| r.kind == RecordKind::Data)
    }

    /// Whether the image has no data byte at all.
    pub fn is_empty(&self) -> bool {
        self.data_records().all(|r| r.data.is_empty())
    }

    /// Number of data bytes in the image.
    pub fn data_len(&self) -> usize {
        self.data_records().map(|r| r.data.len()).sum()
    }

    /// Lowest to one-past-highest data address, `None` for an empty image.
    pub fn span(&self) -> Option<Range<u32>> {
        self.data_records()
            .filter(|r| !r.data.is_empty())
            .map(HexRecord::range)
            .reduce(|a, b| a.start.min(b.start)..a.end.max(b.end))
    }

    /// Entry point declared by a start address record, if any.
    pub fn start_address(&self) -> Option<u32> {
        self.records
            .iter()
            .find(|r| r.kind == RecordKind::StartAddress)
            .map(|r| r.address)
    }

    /// Cut the image into contiguous flash pages.
    ///
    /// Pages run from the page holding the lowest data byte to the page holding
    /// the highest, in ascending order with no gap. Bytes the image does not
    /// define are left at the erased value.
    pub fn pages(&self, page_size: usize) -> Vec<Page> {
        let Some(span) = self.span() else {
            return Vec::new();
        };
        let page_size = page_size.max(1) as u64;
        let first = span.start as u64 / page_size;
        let last = (span.end as u64 - 1) / page_size;

        let mut pages: Vec<Page> = (first..=last)
            .map(|n| Page {
                address: (n * page_size) as u32,
                data: vec![ERASED_BYTE; page_size as usize],
            })
            .collect();

        for record in self.data_records() {
            for (i, &byte) in record.data.iter().enumerate() {
                let address = record.address as u64 + i as u64;
                let Some(page) = pages.get_mut((address / page_size - first) as usize) else {
                    continue;
                };
                page.data[(address % page_size) as usize] = byte;
            }
        }

        pages
    }

    /// SHA-256 digest of the data bytes, in address order, as lowercase hex.
    pub fn sha256(&self) -> String {
        let mut records: Vec<&HexRecord> = self.data_records().collect();
        records.sort_by_key(|r| r.address);

        let mut hasher = Sha256::new();
        for record in records {
            hasher.update(&record.data);
        }
        format!("{:x}", hasher.finalize())
    }

    /// Serialize back to Intel-HEX text.
    ///
    /// Parsing the output yields an image equal to `self`.
    pub fn to_hex_string(&self) -> String {
        let mut out = String::new();
        let mut base = 0u32;

        for record in &self.records {
            match record.kind {
                RecordKind::Data => {
                    let offset = record.address.wrapping_sub(base) as u16;
                    push_line(&mut out, RECORD_DATA, offset, &record.data);
                }
                RecordKind::EndOfFile => push_line(&mut out, RECORD_END_OF_FILE, 0, &[]),
                RecordKind::ExtendedAddress => {
                    base = record.address;
                    if base & 0xFFFF == 0 {
                        let upper = (base >> 16) as u16;
                        push_line(&mut out, RECORD_EXTENDED_LINEAR_ADDRESS, 0, &upper.to_be_bytes());
                    } else {
                        let segment = (base >> 4) as u16;
                        push_line(&mut out, RECORD_EXTENDED_SEGMENT_ADDRESS, 0, &segment.to_be_bytes());
                    }
                }
                RecordKind::StartAddress => {
                    push_line(
                        &mut out,
                        RECORD_START_LINEAR_ADDRESS,
                        0,
                        &record.address.to_be_bytes(),
                    );
                }
            }
        }

        out
    }
}

fn push_line(out: &mut String, record_type: u8, offset: u16, data: &[u8]) {
    let mut bytes = Vec::with_capacity(data.len() + 5);
    bytes.push(data.len() as u8);
    bytes.extend_from_slice(&offset.to_be_bytes());
    bytes.push(record_type);
    bytes.extend_from_slice(data);
    bytes.push(checksum(&bytes));

    out.push(':');
    for byte in bytes {
        let _ = write!(out, "{:02X}", byte);
    }
    out.push('\n');
}

/// Two's complement of the byte sum.
fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

/// Decode the hex digits of a line (without the colon).
fn decode_hex_bytes(digits: &str, line_number: usize) -> Result<Vec<u8>, ParseError> {
    if digits.len() % 2 != 0 || !digits.bytes().all(|c| c.is_ascii_hexdigit()) {
        return Err(ParseError::MalformedLine(line_number));
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| ParseError::MalformedLine(line_number))
        })
        .collect()
}

/// Parse Intel-HEX text into a firmware image.
pub fn parse(text: &str) -> Result<FirmwareImage, ParseError> {
    let mut records = Vec::new();
    let mut data_lines: Vec<(Range<u32>, usize)> = Vec::new();
    let mut base = 0u32;
    let mut end_seen = false;

    for (index, raw_line) in text.lines().enumerate() {
        let line_number = index + 1;
        let line = raw_line.trim();

        if line.is_empty() {
            continue;
        }

        // Only blank lines may follow the end-of-file record.
        if end_seen {
            return Err(ParseError::MalformedLine(line_number));
        }

        let digits = match line.strip_prefix(':') {
            Some(digits) if line.len() >= MIN_LINE_LEN => digits,
            _ => return Err(ParseError::MalformedLine(line_number)),
        };

        let bytes = decode_hex_bytes(digits, line_number)?;
        let count = bytes[0] as usize;
        if bytes.len() != count + 5 {
            return Err(ParseError::MalformedLine(line_number));
        }

        if bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) != 0 {
            return Err(ParseError::ChecksumMismatch(line_number));
        }

        let offset = u16::from_be_bytes([bytes[1], bytes[2]]) as u32;
        let record_type = bytes[3];
        let data = &bytes[4..4 + count];

        let record = match (record_type, count) {
            (RECORD_DATA, _) => {
                let address = base.wrapping_add(offset);
                // The record must end within the 32-bit address space
                let end = address
                    .checked_add(count as u32)
                    .ok_or(ParseError::MalformedLine(line_number))?;
                data_lines.push((address..end, line_number));
                HexRecord {
                    address,
                    data: data.to_vec(),
                    kind: RecordKind::Data,
                }
            }
            (RECORD_END_OF_FILE, 0) => {
                end_seen = true;
                HexRecord {
                    address: 0,
                    data: Vec::new(),
                    kind: RecordKind::EndOfFile,
                }
            }
            (RECORD_EXTENDED_SEGMENT_ADDRESS, 2) => {
                base = (u16::from_be_bytes([data[0], data[1]]) as u32) << 4;
                HexRecord {
                    address: base,
                    data: Vec::new(),
                    kind: RecordKind::ExtendedAddress,
                }
            }
            (RECORD_EXTENDED_LINEAR_ADDRESS, 2) => {
                base = (u16::from_be_bytes([data[0], data[1]]) as u32) << 16;
                HexRecord {
                    address: base,
                    data: Vec::new(),
                    kind: RecordKind::ExtendedAddress,
                }
            }
            (RECORD_START_SEGMENT_ADDRESS, 4) => {
                let segment = u16::from_be_bytes([data[0], data[1]]) as u32;
                let pointer = u16::from_be_bytes([data[2], data[3]]) as u32;
                HexRecord {
                    address: (segment << 4) + pointer,
                    data: Vec::new(),
                    kind: RecordKind::StartAddress,
                }
            }
            (RECORD_START_LINEAR_ADDRESS, 4) => HexRecord {
                address: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
                data: Vec::new(),
                kind: RecordKind::StartAddress,
            },
            _ => return Err(ParseError::MalformedLine(line_number)),
        };

        records.push(record);
    }

    if !end_seen {
        return Err(ParseError::Truncated);
    }

    check_overlaps(data_lines)?;

    Ok(FirmwareImage { records })
}

/// Read and parse a hex file from disk.
pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<FirmwareImage, UpgradeError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| UpgradeError::ImageUnreadable {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse(&text)?)
}

fn check_overlaps(mut ranges: Vec<(Range<u32>, usize)>) -> Result<(), ParseError> {
    ranges.retain(|(range, _)| !range.is_empty());
    ranges.sort_by_key(|(range, line)| (range.start, *line));

    let mut previous: Option<&(Range<u32>, usize)> = None;
    for current in &ranges {
        if let Some(prev) = previous {
            if current.0.start < prev.0.end {
                // Report the record that comes later in the file.
                let (line, address) = if current.1 > prev.1 {
                    (current.1, current.0.start)
                } else {
                    (prev.1, prev.0.start.max(current.0.start))
                };
                return Err(ParseError::Overlap { line, address });
            }
        }
        if previous.map_or(true, |prev| current.0.end > prev.0.end) {
            previous = Some(current);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{HexImageBuilder, TestContext};

    const SCENARIO_IMAGE: &str = ":10000000000102030405060708090A0B0C0D0E0F78\n:00000001FF\n";

    #[test]
    fn test_parse_single_data_record() {
        let image = parse(SCENARIO_IMAGE).unwrap();

        assert_eq!(image.records().len(), 2);
        let data = &image.records()[0];
        assert_eq!(data.kind, RecordKind::Data);
        assert_eq!(data.address, 0);
        assert_eq!(data.data, (0u8..16).collect::<Vec<_>>());
        assert_eq!(image.records()[1].kind, RecordKind::EndOfFile);
        assert_eq!(image.span(), Some(0..16));
    }

    #[test]
    fn test_parse_is_idempotent() {
        assert_eq!(parse(SCENARIO_IMAGE), parse(SCENARIO_IMAGE));
    }

    #[test]
    fn test_extended_linear_address_rebases_data() {
        let text = HexImageBuilder::new()
            .extended_linear(0x0001)
            .data(0x0010, &[0xAA, 0xBB])
            .build();

        let image = parse(&text).unwrap();
        let data: Vec<_> = image.data_records().collect();
        assert_eq!(data[0].address, 0x0001_0010);
        assert_eq!(image.records()[0].kind, RecordKind::ExtendedAddress);
        assert_eq!(image.records()[0].address, 0x0001_0000);
    }

    #[test]
    fn test_extended_segment_address_rebases_data() {
        let text = HexImageBuilder::new()
            .extended_segment(0x1200)
            .data(0x0004, &[0x01])
            .build();

        let image = parse(&text).unwrap();
        assert_eq!(image.data_records().next().unwrap().address, 0x12004);
    }

    #[test]
    fn test_start_address_records() {
        let text = HexImageBuilder::new()
            .data(0, &[1, 2])
            .start_linear(0x0000_0100)
            .build();
        assert_eq!(parse(&text).unwrap().start_address(), Some(0x100));

        let text = HexImageBuilder::new()
            .data(0, &[1, 2])
            .start_segment(0x0010, 0x0004)
            .build();
        assert_eq!(parse(&text).unwrap().start_address(), Some(0x104));
    }

    #[test]
    fn test_missing_end_of_file_is_truncated() {
        let text = ":10000000000102030405060708090A0B0C0D0E0F78\n";
        assert_eq!(parse(text), Err(ParseError::Truncated));
        assert_eq!(parse(""), Err(ParseError::Truncated));
    }

    #[test]
    fn test_every_altered_checksum_is_rejected() {
        let text = HexImageBuilder::new()
            .extended_linear(0)
            .data(0x0000, &[0x10, 0x20, 0x30])
            .data(0x0003, &[0x40])
            .start_linear(0)
            .build();

        let lines: Vec<&str> = text.lines().collect();
        for target in 0..lines.len() {
            let (head, tail) = lines[target].split_at(lines[target].len() - 2);
            let value = u8::from_str_radix(tail, 16).unwrap().wrapping_add(1);
            let replaced = format!("{}{:02X}", head, value);

            let mut altered = lines.clone();
            altered[target] = &replaced;

            let result = parse(&altered.join("\n"));
            assert_eq!(result, Err(ParseError::ChecksumMismatch(target + 1)));
        }
    }

    #[test]
    fn test_malformed_lines() {
        // Missing colon
        assert_eq!(
            parse("00000001FF\n"),
            Err(ParseError::MalformedLine(1))
        );
        // Too short
        assert_eq!(parse(":000001FF\n"), Err(ParseError::MalformedLine(1)));
        // Not hex
        assert_eq!(
            parse(":0000000GFF\n:00000001FF\n"),
            Err(ParseError::MalformedLine(1))
        );
        // Byte count disagrees with line length
        assert_eq!(
            parse(":00000001FF\n").map(|_| ()),
            Ok(())
        );
        assert_eq!(
            parse(":0200000001FD\n:00000001FF\n"),
            Err(ParseError::MalformedLine(1))
        );
        // Unknown record type 06
        assert_eq!(
            parse(":00000006FA\n:00000001FF\n"),
            Err(ParseError::MalformedLine(1))
        );
    }

    #[test]
    fn test_line_numbers_count_blank_lines() {
        let text = "\n:00000001FF\n";
        assert!(parse(text).is_ok());

        let text = "\n\n:0000000GFF\n";
        assert_eq!(parse(text), Err(ParseError::MalformedLine(3)));
    }

    #[test]
    fn test_records_after_end_of_file_are_rejected() {
        let text = ":00000001FF\n:00000001FF\n";
        assert_eq!(parse(text), Err(ParseError::MalformedLine(2)));

        let text = ":00000001FF\r\n\r\n";
        assert!(parse(text).is_ok());
    }

    #[test]
    fn test_overlapping_data_is_rejected() {
        let text = HexImageBuilder::new()
            .data(0x0000, &[0; 8])
            .data(0x0004, &[0; 8])
            .build();

        assert_eq!(
            parse(&text),
            Err(ParseError::Overlap {
                line: 2,
                address: 0x0004
            })
        );
    }

    #[test]
    fn test_data_past_end_of_address_space_is_rejected() {
        let text = HexImageBuilder::new()
            .extended_linear(0xFFFF)
            .data(0xFFF8, &[0xAB; 16])
            .build();

        assert_eq!(parse(&text), Err(ParseError::MalformedLine(2)));
    }

    #[test]
    fn test_pages_at_top_of_address_space() {
        let text = HexImageBuilder::new()
            .extended_linear(0xFFFF)
            .data(0xFFF0, &[0xAB; 15])
            .build();
        let image = parse(&text).unwrap();
        assert_eq!(image.span(), Some(0xFFFF_FFF0..0xFFFF_FFFF));

        let pages = image.pages(64);
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].address, 0xFFFF_FFC0);
        assert_eq!(pages[0].data[48..63], [0xAB; 15]);
        assert_eq!(pages[0].data[63], ERASED_BYTE);
    }

    #[test]
    fn test_adjacent_data_is_accepted() {
        let text = HexImageBuilder::new()
            .data(0x0008, &[0; 8])
            .data(0x0000, &[0; 8])
            .build();

        let image = parse(&text).unwrap();
        assert_eq!(image.span(), Some(0..16));
        assert_eq!(image.data_len(), 16);
    }

    #[test]
    fn test_serialize_round_trip() {
        let text = HexImageBuilder::new()
            .extended_segment(0x1000)
            .data(0x0000, &[1, 2, 3])
            .extended_linear(0x0002)
            .data(0xFFF0, &[4, 5, 6, 7])
            .start_segment(0x0000, 0x0100)
            .build();

        let image = parse(&text).unwrap();
        let again = parse(&image.to_hex_string()).unwrap();
        assert_eq!(again, image);
        assert_eq!(parse(&again.to_hex_string()).unwrap(), image);
    }

    #[test]
    fn test_pages_are_contiguous_and_padded() {
        let text = HexImageBuilder::new()
            .data(0x0002, &[0x11, 0x22])
            .data(0x0010, &[0x33])
            .build();
        let image = parse(&text).unwrap();

        let pages = image.pages(8);
        let addresses: Vec<u32> = pages.iter().map(|p| p.address).collect();
        assert_eq!(addresses, vec![0, 8, 16]);

        assert_eq!(pages[0].data, vec![0xFF, 0xFF, 0x11, 0x22, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(pages[1].data, vec![0xFF; 8]);
        assert_eq!(pages[2].data[0], 0x33);
    }

    #[test]
    fn test_pages_cover_span_exactly_once() {
        let text = HexImageBuilder::new()
            .data(0x0123, &[0xA5; 200])
            .data(0x0400, &[0x5A; 17])
            .build();
        let image = parse(&text).unwrap();
        let page_size = 64;
        let pages = image.pages(page_size);

        for pair in pages.windows(2) {
            assert_eq!(pair[1].address, pair[0].address + page_size as u32);
        }
        let span = image.span().unwrap();
        assert!(pages[0].address <= span.start);
        let last = pages.last().unwrap();
        assert!(last.address + page_size as u32 >= span.end);
        assert!(last.address < span.end);

        let written: usize = pages
            .iter()
            .map(|p| p.data.iter().filter(|&&b| b != ERASED_BYTE).count())
            .sum();
        assert_eq!(written, image.data_len());
    }

    #[test]
    fn test_empty_image() {
        let image = parse(":00000001FF\n").unwrap();
        assert!(image.is_empty());
        assert_eq!(image.span(), None);
        assert!(image.pages(256).is_empty());
    }

    #[test]
    fn test_sha256_is_stable() {
        let image = parse(SCENARIO_IMAGE).unwrap();
        let digest = image.sha256();
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, parse(SCENARIO_IMAGE).unwrap().sha256());
    }

    #[test]
    fn test_parse_file() {
        let ctx = TestContext::new();
        let path = ctx.create_file("firmware.hex", SCENARIO_IMAGE);
        assert!(parse_file(&path).is_ok());

        let missing = parse_file(ctx.path("missing.hex"));
        assert!(matches!(missing, Err(UpgradeError::ImageUnreadable { .. })));
    }
}
