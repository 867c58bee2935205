//! Firmware images.
//!
//! A [`FirmwareImage`] is a start address plus one contiguous run of bytes.
//! Gaps cannot be represented. Images travel to and from disk in the
//! line-oriented hex record format implemented in [`hex`].

pub mod hex;

use {
    crate::error::{Error, Result},
    log::debug,
    std::{
        fs::File,
        io::{BufReader, BufWriter, Write},
        path::Path,
    },
};

/// Size of the 16-bit address space covered by hex data records.
pub const ADDRESS_SPACE: u32 = 0x1_0000;

/// A contiguous firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    start_address: u32,
    data: Vec<u8>,
}

impl FirmwareImage {
    /// Create an image, rejecting one that runs past the 16-bit address space.
    pub fn new(start_address: u32, data: Vec<u8>) -> Result<Self> {
        let available = ADDRESS_SPACE.saturating_sub(start_address) as usize;
        if start_address >= ADDRESS_SPACE || data.len() > available {
            return Err(Error::ImageTooLarge {
                size: data.len(),
                available,
            });
        }
        Ok(Self {
            start_address,
            data,
        })
    }

    /// Address of the first byte.
    pub fn start_address(&self) -> u32 {
        self.start_address
    }

    /// Address one past the last byte.
    pub fn end_address(&self) -> u32 {
        // new() guarantees the sum stays within ADDRESS_SPACE
        self.start_address + self.data.len() as u32
    }

    /// Image bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consume the image and return its bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Number of bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the image holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Pages needed to program the image; the last one may be partial.
    ///
    /// Returns 0 for a zero page size.
    pub fn page_count(&self, page_size: usize) -> usize {
        if page_size == 0 {
            return 0;
        }
        self.data.len().div_ceil(page_size)
    }

    /// Load an image from a hex file.
    ///
    /// `Ok(None)` means the file holds no data records.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();
        debug!("Loading hex image from: {}", path.display());

        let file = File::open(path)?;
        hex::decode_reader(BufReader::new(file))
    }

    /// Save the image as a hex file, replacing any existing file.
    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        debug!(
            "Writing {} bytes at 0x{:04X} to: {}",
            self.len(),
            self.start_address,
            path.display()
        );

        let mut writer = BufWriter::new(File::create(path)?);
        hex::encode_to(self, &mut writer)?;
        writer.flush()?;
        Ok(())
    }
}
