//! Bootloader wire frames.
//!
//! ## Frame Format
//!
//! ```text
//! +-------+-----+----------+-------------------+
//! | Start | CMD |  Length  |      Payload      |
//! +-------+-----+----------+-------------------+
//! |   1   |  1  | 2 (BE)   |  Length bytes     |
//! +-------+-----+----------+-------------------+
//! | 0x01  | cmd | n        |  data             |
//! +-------+-----+----------+-------------------+
//! ```
//!
//! A response carries the bitwise complement of the request command
//! (`!cmd`), or [`ERROR_CODE`] when the device refused the request.

use {
    byteorder::{BigEndian, ByteOrder},
    log::warn,
    std::fmt,
};

/// First byte of every frame.
pub const START_OF_FRAME: u8 = 0x01;

/// Command byte of a response that signals failure.
pub const ERROR_CODE: u8 = 0xFF;

/// Size of the frame header (start, command, length).
pub const HEADER_LEN: usize = 4;

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Payload bytes shown before a frame dump is truncated.
const MAX_DUMP_PAYLOAD: usize = 20;

/// Bootloader commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Enter programming mode.
    Activate = 0x02,
    /// Leave programming mode.
    Deactivate = 0x03,
    /// Report the bootloader version.
    Version = 0x04,
    /// Report the device (MCU) name.
    DeviceName = 0x10,
    /// Report the module (board) name.
    ModuleName = 0x11,
    /// Report the boot section size in bytes.
    BootSize = 0x20,
    /// Report the flash size in KB.
    FlashSize = 0x21,
    /// Report the page size in bytes.
    PageSize = 0x22,
    /// Select the page for the next read or write.
    SetPageAddress = 0x30,
    /// Read the selected page.
    ReadPage = 0x31,
    /// Program the selected page.
    WritePage = 0x32,
}

impl Command {
    /// All commands, in code order.
    pub const ALL: [Self; 11] = [
        Self::Activate,
        Self::Deactivate,
        Self::Version,
        Self::DeviceName,
        Self::ModuleName,
        Self::BootSize,
        Self::FlashSize,
        Self::PageSize,
        Self::SetPageAddress,
        Self::ReadPage,
        Self::WritePage,
    ];

    /// Numeric command code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Command byte a device answers this command with on success.
    pub fn echo(self) -> u8 {
        !(self as u8)
    }

    /// Look up a command by its code.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    /// Human-readable command name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
            Self::Version => "version",
            Self::DeviceName => "device name",
            Self::ModuleName => "module name",
            Self::BootSize => "boot size",
            Self::FlashSize => "flash size",
            Self::PageSize => "page size",
            Self::SetPageAddress => "set page address",
            Self::ReadPage => "read page",
            Self::WritePage => "write page",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.code())
    }
}

/// Whether `response` is the successful echo of `request`.
///
/// The device answers with the one's complement of the request byte.
pub fn is_echo_of(response: u8, request: u8) -> bool {
    response == !request
}

/// Build a request frame.
///
/// Payloads longer than [`MAX_PAYLOAD`] are truncated to fit the length field.
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn build_frame(command: u8, payload: &[u8]) -> Vec<u8> {
    let payload = if payload.len() > MAX_PAYLOAD {
        warn!(
            "Payload of {} bytes truncated to {MAX_PAYLOAD}",
            payload.len()
        );
        &payload[..MAX_PAYLOAD]
    } else {
        payload
    };

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(START_OF_FRAME);
    buf.push(command);
    let mut len = [0u8; 2];
    BigEndian::write_u16(&mut len, payload.len() as u16);
    buf.extend_from_slice(&len);
    buf.extend_from_slice(payload);
    buf
}

/// Payload of a set-page-address request.
pub fn address_payload(address: u32) -> [u8; 4] {
    let mut payload = [0u8; 4];
    BigEndian::write_u32(&mut payload, address);
    payload
}

/// Declared total length of the frame at the start of `buf`, if the header is complete.
pub fn declared_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < HEADER_LEN || buf[0] != START_OF_FRAME {
        return None;
    }
    Some(HEADER_LEN + usize::from(BigEndian::read_u16(&buf[2..4])))
}

/// A complete frame as received from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    /// Wrap raw bytes that already form one complete frame.
    ///
    /// Returns `None` when the header is missing or the length does not match.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        (declared_len(&bytes) == Some(bytes.len())).then_some(Self { bytes })
    }

    /// Command byte.
    pub fn command(&self) -> u8 {
        self.bytes[1]
    }

    /// Payload following the header.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..]
    }

    /// The whole frame, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether the device signalled an error.
    pub fn is_error(&self) -> bool {
        self.command() == ERROR_CODE
    }

    /// Whether this frame answers `request` successfully.
    pub fn is_echo_of(&self, request: Command) -> bool {
        is_echo_of(self.command(), request.code())
    }

    /// Consume the frame, returning its payload.
    pub fn into_payload(mut self) -> Vec<u8> {
        self.bytes.split_off(HEADER_LEN)
    }
}

/// Accumulates received bytes until one complete frame is present.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
    discarded: usize,
}

impl FrameAssembler {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    ///
    /// Bytes before the first start marker are dropped.
    pub fn push(&mut self, data: &[u8]) {
        let data = if self.buf.is_empty() {
            let skip = data
                .iter()
                .position(|&b| b == START_OF_FRAME)
                .unwrap_or(data.len());
            self.discarded += skip;
            &data[skip..]
        } else {
            data
        };
        self.buf.extend_from_slice(data);
    }

    /// Bytes accumulated so far (noise excluded).
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been accumulated.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Number of bytes dropped before the start marker.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Whether the buffer holds a complete frame.
    pub fn is_complete(&self) -> bool {
        declared_len(&self.buf).is_some_and(|n| self.buf.len() >= n)
    }

    /// Take the complete frame out of the buffer.
    ///
    /// Bytes received after the declared end are discarded.
    pub fn take_frame(&mut self) -> Option<Frame> {
        let n = declared_len(&self.buf).filter(|&n| self.buf.len() >= n)?;
        if self.buf.len() > n {
            warn!(
                "Discarding {} bytes received after the response frame",
                self.buf.len() - n
            );
        }
        let mut bytes = std::mem::take(&mut self.buf);
        bytes.truncate(n);
        Some(Frame { bytes })
    }
}

/// Render a frame for logging: `0x01 0xFD 0x00 0x00 ...`.
pub fn dump(frame: &[u8]) -> String {
    let shown = frame.len().min(HEADER_LEN + MAX_DUMP_PAYLOAD);
    let mut out = frame[..shown]
        .iter()
        .map(|b| format!("0x{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ");
    let payload = frame.len().saturating_sub(HEADER_LEN);
    if payload > MAX_DUMP_PAYLOAD {
        out.push_str(&format!(" ... ({payload} data bytes)"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_is_ones_complement() {
        assert!(is_echo_of(0xFD, 0x02));
        assert!(is_echo_of(0xCD, 0x32));
        assert!(is_echo_of(0x00, 0xFF));
        assert!(!is_echo_of(0xFE, 0x02));
        assert!(!is_echo_of(0x02, 0x02));
        assert!(!is_echo_of(ERROR_CODE, 0x02));
    }

    #[test]
    fn test_no_command_echoes_to_error_code() {
        for cmd in Command::ALL {
            assert_ne!(cmd.echo(), ERROR_CODE, "{cmd}");
            assert!(is_echo_of(cmd.echo(), cmd.code()));
        }
    }

    #[test]
    fn test_command_codes() {
        assert_eq!(Command::Activate.code(), 0x02);
        assert_eq!(Command::Deactivate.code(), 0x03);
        assert_eq!(Command::Version.code(), 0x04);
        assert_eq!(Command::DeviceName.code(), 0x10);
        assert_eq!(Command::ModuleName.code(), 0x11);
        assert_eq!(Command::BootSize.code(), 0x20);
        assert_eq!(Command::FlashSize.code(), 0x21);
        assert_eq!(Command::PageSize.code(), 0x22);
        assert_eq!(Command::SetPageAddress.code(), 0x30);
        assert_eq!(Command::ReadPage.code(), 0x31);
        assert_eq!(Command::WritePage.code(), 0x32);
    }

    #[test]
    fn test_from_code() {
        for cmd in Command::ALL {
            assert_eq!(Command::from_code(cmd.code()), Some(cmd));
        }
        assert_eq!(Command::from_code(0x00), None);
        assert_eq!(Command::from_code(ERROR_CODE), None);
    }

    #[test]
    fn test_build_frame_empty_payload() {
        assert_eq!(build_frame(0x02, &[]), vec![0x01, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_build_frame_length_is_big_endian() {
        let payload = vec![0x5A; 0x0123];
        let frame = build_frame(0x32, &payload);
        assert_eq!(frame.len(), HEADER_LEN + 0x0123);
        assert_eq!(&frame[..4], &[0x01, 0x32, 0x01, 0x23]);
        assert_eq!(declared_len(&frame), Some(frame.len()));
    }

    #[test]
    fn test_address_payload_is_big_endian() {
        assert_eq!(address_payload(0x0001_0280), [0x00, 0x01, 0x02, 0x80]);
        assert_eq!(address_payload(0), [0; 4]);
    }

    #[test]
    fn test_assembler_completes_exactly_at_declared_length() {
        let frame = [0x01, 0xDD, 0x00, 0x02, 0x12, 0x34];
        let mut asm = FrameAssembler::new();
        for (i, b) in frame.iter().enumerate() {
            assert!(!asm.is_complete(), "complete too early at byte {i}");
            asm.push(&[*b]);
        }
        assert!(asm.is_complete());
        let got = asm.take_frame().unwrap();
        assert_eq!(got.command(), 0xDD);
        assert_eq!(got.payload(), &[0x12, 0x34]);
        assert!(asm.is_empty());
        assert!(asm.take_frame().is_none());
    }

    #[test]
    fn test_assembler_needs_four_header_bytes() {
        let mut asm = FrameAssembler::new();
        asm.push(&[0x01, 0xFD, 0x00]);
        assert!(!asm.is_complete());
        asm.push(&[0x00]);
        assert!(asm.is_complete());
    }

    #[test]
    fn test_assembler_skips_noise_before_start() {
        let mut asm = FrameAssembler::new();
        asm.push(&[0x00, 0x55, 0x01, 0xFD, 0x00, 0x00]);
        assert_eq!(asm.discarded(), 2);
        let frame = asm.take_frame().unwrap();
        assert!(frame.is_echo_of(Command::Activate));
    }

    #[test]
    fn test_assembler_drops_trailing_bytes() {
        let mut asm = FrameAssembler::new();
        asm.push(&[0x01, 0xFB, 0x00, 0x01, 0x07, 0xAA, 0xBB]);
        let frame = asm.take_frame().unwrap();
        assert_eq!(frame.as_bytes(), &[0x01, 0xFB, 0x00, 0x01, 0x07]);
    }

    #[test]
    fn test_frame_from_bytes_checks_length() {
        assert!(Frame::from_bytes(vec![0x01, 0xFD, 0x00, 0x00]).is_some());
        assert!(Frame::from_bytes(vec![0x01, 0xFD, 0x00, 0x01]).is_none());
        assert!(Frame::from_bytes(vec![0x02, 0xFD, 0x00, 0x00]).is_none());
        assert!(Frame::from_bytes(vec![0x01, 0xFD]).is_none());
    }

    #[test]
    fn test_error_frame() {
        let frame = Frame::from_bytes(vec![0x01, ERROR_CODE, 0x00, 0x00]).unwrap();
        assert!(frame.is_error());
        assert!(!frame.is_echo_of(Command::Activate));
    }

    #[test]
    fn test_dump_truncates_long_payload() {
        let frame = build_frame(0x32, &[0xAB; 128]);
        let text = dump(&frame);
        assert!(text.starts_with("0x01 0x32 0x00 0x80 0xAB"));
        assert!(text.ends_with("... (128 data bytes)"));
        assert_eq!(dump(&[0x01, 0xFD, 0x00, 0x00]), "0x01 0xFD 0x00 0x00");
    }
}
