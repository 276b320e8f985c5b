//! Intel HEX record parser.
//!
//! Records look like `:LLAAAATT[DD...]CC`. The bootloader receives them one
//! byte at a time, so parsing happens in two stages: [`LineAssembler`]
//! collects the characters of one line, [`Record::parse`] decodes and
//! validates them. [`parse_hex`] decodes a whole file into a flash image
//! for host-side verification.
//!
//! Supported record types: 00 (data), 01 (EOF), 02 (extended segment
//! address), 03 (start segment address), 04 (extended linear address)
//! and 05 (start linear address).

use crate::error::HexError;

/// Start code of every record.
pub const START_CODE: u8 = b':';
/// Line end. Intel tools emit CR LF, the LF is skipped while waiting for `:`.
pub const LINE_END: u8 = 0x0D;
/// Maximum data bytes per record.
pub const MAX_DATA_BYTES: usize = 16;
/// Characters of a record after the start code: length, address, type,
/// data and checksum fields.
pub const MAX_LINE_CHARS: usize = 2 + 4 + 2 + 2 * MAX_DATA_BYTES + 2;

/// Result of feeding one byte into the [`LineAssembler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// Waiting for the start code or for more characters.
    Busy,
    /// A full line is available through [`LineAssembler::line`].
    Complete,
}

/// Collects the characters of one record between `:` and CR.
pub struct LineAssembler {
    buf: [u8; MAX_LINE_CHARS],
    len: usize,
    active: bool,
    complete: bool,
}

impl LineAssembler {
    pub fn new() -> Self {
        LineAssembler { buf: [0; MAX_LINE_CHARS], len: 0, active: false, complete: false }
    }

    pub fn reset(&mut self) {
        *self = LineAssembler::new();
    }

    /// Feed one received byte.
    ///
    /// A `:` always restarts the line, which lets the host resynchronise
    /// after garbage. On overflow the partial line is dropped.
    pub fn push(&mut self, byte: u8) -> Result<LineStatus, HexError> {
        if self.complete {
            self.complete = false;
            self.len = 0;
        }

        if byte == START_CODE {
            self.len = 0;
            self.active = true;
            return Ok(LineStatus::Busy);
        }

        if !self.active {
            return Ok(LineStatus::Busy);
        }

        if byte == LINE_END {
            self.active = false;
            self.complete = true;
            return Ok(LineStatus::Complete);
        }

        if self.len == self.buf.len() {
            self.active = false;
            self.len = 0;
            return Err(HexError::LineOverflow(MAX_LINE_CHARS));
        }

        self.buf[self.len] = byte;
        self.len += 1;
        Ok(LineStatus::Busy)
    }

    /// Characters of the last complete line, without `:` and CR.
    pub fn line(&self) -> &[u8] {
        if self.complete { &self.buf[..self.len] } else { &[] }
    }
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoded record payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKind {
    /// Data bytes for `address` (relative to the current base).
    Data(Vec<u8>),
    EndOfFile,
    /// Type 02: base address = segment << 4.
    ExtendedSegmentAddress(u16),
    /// Type 03: CS:IP entry point.
    StartSegmentAddress { cs: u16, ip: u16 },
    /// Type 04: base address = upper << 16.
    ExtendedLinearAddress(u16),
    /// Type 05: 32-bit entry point.
    StartLinearAddress(u32),
}

/// One validated Intel-HEX record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub address: u16,
    pub kind: RecordKind,
}

impl Record {
    /// Decode and validate the characters of one record (without `:`).
    pub fn parse(chars: &[u8]) -> Result<Record, HexError> {
        let bytes = hex_line_to_bytes(chars)?;
        if bytes.len() < 5 {
            return Err(HexError::MalformedRecord("line too short"));
        }

        let byte_count = bytes[0] as usize;
        if bytes.len() != byte_count + 5 {
            return Err(HexError::MalformedRecord("length field does not match line"));
        }
        if byte_count > MAX_DATA_BYTES {
            return Err(HexError::MalformedRecord("too many data bytes"));
        }

        let body = &bytes[..bytes.len() - 1];
        let found = bytes[bytes.len() - 1];
        let expected = checksum(body);
        if expected != found {
            return Err(HexError::ChecksumMismatch { expected, found });
        }

        let address = ((bytes[1] as u16) << 8) | bytes[2] as u16;
        let payload = &bytes[4..4 + byte_count];

        let kind = match bytes[3] {
            0x00 => RecordKind::Data(payload.to_vec()),
            0x01 => {
                if byte_count != 0 {
                    return Err(HexError::MalformedRecord("EOF record carries data"));
                }
                RecordKind::EndOfFile
            }
            0x02 => RecordKind::ExtendedSegmentAddress(be16(payload, "segment record needs 2 bytes")?),
            0x03 => {
                if byte_count != 4 {
                    return Err(HexError::MalformedRecord("start segment record needs 4 bytes"));
                }
                RecordKind::StartSegmentAddress {
                    cs: ((payload[0] as u16) << 8) | payload[1] as u16,
                    ip: ((payload[2] as u16) << 8) | payload[3] as u16,
                }
            }
            0x04 => RecordKind::ExtendedLinearAddress(be16(payload, "linear record needs 2 bytes")?),
            0x05 => {
                if byte_count != 4 {
                    return Err(HexError::MalformedRecord("start linear record needs 4 bytes"));
                }
                RecordKind::StartLinearAddress(u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]))
            }
            _ => return Err(HexError::MalformedRecord("unknown record type")),
        };

        Ok(Record { address, kind })
    }
}

/// Two's complement of the byte sum, as stored in the checksum field.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)).wrapping_neg()
}

fn be16(payload: &[u8], what: &'static str) -> Result<u16, HexError> {
    if payload.len() != 2 {
        return Err(HexError::MalformedRecord(what));
    }
    Ok(((payload[0] as u16) << 8) | payload[1] as u16)
}

/// Tracks the address base and entry point across records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressState {
    pub base: u32,
    pub entry: Option<u32>,
}

impl AddressState {
    /// Apply an address or entry record. Returns the absolute address for
    /// data records, `None` for everything else.
    pub fn apply(&mut self, record: &Record) -> Option<u32> {
        match record.kind {
            RecordKind::Data(_) => Some(self.base.wrapping_add(record.address as u32)),
            RecordKind::ExtendedSegmentAddress(seg) => { self.base = (seg as u32) << 4; None }
            RecordKind::ExtendedLinearAddress(upper) => { self.base = (upper as u32) << 16; None }
            RecordKind::StartSegmentAddress { cs, ip } => {
                self.entry = Some(((cs as u32) << 4) + ip as u32);
                None
            }
            RecordKind::StartLinearAddress(addr) => { self.entry = Some(addr); None }
            RecordKind::EndOfFile => None,
        }
    }
}

/// Parse Intel HEX text and load it into a flash image.
///
/// Returns the number of bytes covered (highest address reached). Data
/// beyond the end of `flash` is rejected rather than silently dropped.
pub fn parse_hex(hex: &str, flash: &mut [u8]) -> Result<usize, HexError> {
    let mut max_addr = 0usize;
    let mut addr_state = AddressState::default();

    for line in hex.lines() {
        let line = line.trim();
        if line.is_empty() { continue; }
        let Some(chars) = line.strip_prefix(':') else {
            continue; // skip non-hex lines
        };

        let record = Record::parse(chars.as_bytes())?;
        if record.kind == RecordKind::EndOfFile {
            break;
        }

        if let Some(start) = addr_state.apply(&record) {
            if let RecordKind::Data(data) = &record.kind {
                let start = start as usize;
                let end = start + data.len();
                if end > flash.len() {
                    return Err(HexError::MalformedRecord("data beyond end of flash"));
                }
                flash[start..end].copy_from_slice(data);
                max_addr = max_addr.max(end);
            }
        }
    }

    Ok(max_addr)
}

/// Convert hex character pairs to bytes
fn hex_line_to_bytes(chars: &[u8]) -> Result<Vec<u8>, HexError> {
    if chars.len() % 2 != 0 {
        return Err(HexError::MalformedRecord("odd number of hex characters"));
    }

    chars
        .chunks(2)
        .map(|pair| Ok((hex_digit(pair[0])? << 4) | hex_digit(pair[1])?))
        .collect()
}

fn hex_digit(c: u8) -> Result<u8, HexError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(HexError::MalformedRecord("invalid hex character")),
    }
}

/// Encode one record as text (without line ending). Used by tests and the
/// host tool to build streams.
pub fn encode_record(record_type: u8, address: u16, data: &[u8]) -> String {
    let mut bytes = Vec::with_capacity(data.len() + 5);
    bytes.push(data.len() as u8);
    bytes.push((address >> 8) as u8);
    bytes.push(address as u8);
    bytes.push(record_type);
    bytes.extend_from_slice(data);
    bytes.push(checksum(&bytes));

    let mut line = String::with_capacity(1 + bytes.len() * 2);
    line.push(':');
    for b in bytes {
        line.push_str(&format!("{:02X}", b));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn feed(asm: &mut LineAssembler, text: &[u8]) -> Vec<Result<LineStatus, HexError>> {
        text.iter().map(|&b| asm.push(b)).collect()
    }

    #[test]
    fn test_parse_simple_hex() {
        let hex = ":100000000C9434000C944E000C944E000C944E0052\n:00000001FF\n";
        let mut flash = vec![0u8; 32768];
        let size = parse_hex(hex, &mut flash).unwrap();
        assert_eq!(size, 16);
        assert_eq!(&flash[..6], &[0x0C, 0x94, 0x34, 0x00, 0x0C, 0x94]);
    }

    #[test]
    fn test_checksum_error() {
        let hex = ":100000000C9434000C944E000C944E000C944E00FF\n:00000001FF\n";
        let mut flash = vec![0u8; 32768];
        assert_eq!(
            parse_hex(hex, &mut flash),
            Err(HexError::ChecksumMismatch { expected: 0x52, found: 0xFF })
        );
    }

    #[test]
    fn test_empty_hex() {
        let mut flash = vec![0u8; 32768];
        assert_eq!(parse_hex(":00000001FF\n", &mut flash).unwrap(), 0);
    }

    #[test]
    fn test_segment_and_linear_base() {
        let hex = format!(
            "{}\n{}\n{}\n{}\n{}\n",
            encode_record(0x02, 0, &[0x10, 0x00]),
            encode_record(0x00, 0x0004, &[0xAA, 0xBB]),
            encode_record(0x04, 0, &[0x00, 0x01]),
            encode_record(0x00, 0x0010, &[0xCC]),
            ":00000001FF",
        );
        let mut flash = vec![0u8; 0x20000];
        let size = parse_hex(&hex, &mut flash).unwrap();
        assert_eq!(flash[0x10004], 0xAA);
        assert_eq!(flash[0x10005], 0xBB);
        assert_eq!(flash[0x10010], 0xCC);
        assert_eq!(size, 0x10011);
    }

    #[test]
    fn test_data_beyond_flash_rejected() {
        let hex = format!("{}\n", encode_record(0x00, 0x00FE, &[1, 2, 3, 4]));
        let mut flash = vec![0u8; 0x100];
        assert!(matches!(parse_hex(&hex, &mut flash), Err(HexError::MalformedRecord(_))));
    }

    #[test]
    fn test_eof_record() {
        let rec = Record::parse(b"00000001FF").unwrap();
        assert_eq!(rec.kind, RecordKind::EndOfFile);
    }

    #[test]
    fn test_start_segment_entry() {
        let line = encode_record(0x03, 0, &[0x10, 0x00, 0x00, 0x20]);
        let rec = Record::parse(line[1..].as_bytes()).unwrap();
        let mut st = AddressState::default();
        assert_eq!(st.apply(&rec), None);
        assert_eq!(st.entry, Some(0x10020));
    }

    #[test]
    fn test_start_linear_entry() {
        let line = encode_record(0x05, 0, &[0x00, 0x01, 0x00, 0x00]);
        let rec = Record::parse(line[1..].as_bytes()).unwrap();
        let mut st = AddressState::default();
        st.apply(&rec);
        assert_eq!(st.entry, Some(0x10000));
    }

    #[test]
    fn test_malformed_records() {
        // unknown type 06
        let bad_type = encode_record(0x06, 0, &[]);
        assert!(matches!(Record::parse(bad_type[1..].as_bytes()), Err(HexError::MalformedRecord(_))));
        // non-hex character
        assert!(matches!(Record::parse(b"0000000GFF"), Err(HexError::MalformedRecord(_))));
        // odd number of characters
        assert!(matches!(Record::parse(b"00000001F"), Err(HexError::MalformedRecord(_))));
        // length field says 2 bytes, none present
        assert!(matches!(Record::parse(b"02000000FE"), Err(HexError::MalformedRecord(_))));
        // segment record with one byte
        let short = encode_record(0x02, 0, &[0x10]);
        assert!(matches!(Record::parse(short[1..].as_bytes()), Err(HexError::MalformedRecord(_))));
    }

    #[test]
    fn test_lowercase_digits() {
        let rec = Record::parse(b"02000000abcd86").unwrap();
        assert_eq!(rec.kind, RecordKind::Data(vec![0xAB, 0xCD]));
    }

    #[test]
    fn test_assembler_skips_noise_and_lf() {
        let mut asm = LineAssembler::new();
        let res = feed(&mut asm, b"\nxx:00000001FF\r");
        assert_eq!(*res.last().unwrap(), Ok(LineStatus::Complete));
        assert_eq!(asm.line(), b"00000001FF");

        // LF after CR is ignored, next line starts cleanly
        assert_eq!(asm.push(b'\n'), Ok(LineStatus::Busy));
        assert_eq!(asm.line(), b"");
        feed(&mut asm, b":0000");
        assert_eq!(asm.push(LINE_END), Ok(LineStatus::Complete));
        assert_eq!(asm.line(), b"0000");
    }

    #[test]
    fn test_assembler_restarts_on_start_code() {
        let mut asm = LineAssembler::new();
        feed(&mut asm, b":1234:00000001FF");
        assert_eq!(asm.push(LINE_END), Ok(LineStatus::Complete));
        assert_eq!(asm.line(), b"00000001FF");
    }

    #[test]
    fn test_assembler_overflow() {
        let mut asm = LineAssembler::new();
        asm.push(b':').unwrap();
        for _ in 0..MAX_LINE_CHARS {
            assert_eq!(asm.push(b'0'), Ok(LineStatus::Busy));
        }
        assert_eq!(asm.push(b'0'), Err(HexError::LineOverflow(MAX_LINE_CHARS)));
        // CR after overflow does not produce a line
        assert_eq!(asm.push(LINE_END), Ok(LineStatus::Busy));
    }

    proptest! {
        #[test]
        fn valid_records_decode_exactly(
            address in any::<u16>(),
            data in prop::collection::vec(any::<u8>(), 0..=MAX_DATA_BYTES),
        ) {
            let line = encode_record(0x00, address, &data);
            let rec = Record::parse(line[1..].as_bytes()).unwrap();
            prop_assert_eq!(rec.address, address);
            prop_assert_eq!(rec.kind, RecordKind::Data(data));
        }

        #[test]
        fn corrupted_checksum_is_rejected(
            address in any::<u16>(),
            data in prop::collection::vec(any::<u8>(), 0..=MAX_DATA_BYTES),
            delta in 1u8..=255,
        ) {
            let line = encode_record(0x00, address, &data);
            let good = u8::from_str_radix(&line[line.len() - 2..], 16).unwrap();
            let bad = format!("{}{:02X}", &line[1..line.len() - 2], good.wrapping_add(delta));
            let res = Record::parse(bad.as_bytes());
            prop_assert_eq!(res, Err(HexError::ChecksumMismatch { expected: good, found: good.wrapping_add(delta) }));
        }
    }
}
