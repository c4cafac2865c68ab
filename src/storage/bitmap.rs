use std::path::Path;
use crate::core::error::{Error, Result};
use crate::mmap::mmap_file::{MmapFile, HEADER_LEN};

/// Packed bit array persisted through an `MmapFile`.
///
/// The data region `[HEADER_LEN, cursor)` is pre-sized at creation (the cursor marks
/// its end), so the header doubles as the stored length. Bit `i` lives in byte
/// `HEADER_LEN + i / 8` at position `i % 8`.
pub struct Bitmap {
    file: MmapFile,
    size: u64,
    max_one: Option<u64>,
}

impl Bitmap {
    /// Open an existing bitmap or create one holding at least `bits` bits.
    pub fn open<P: AsRef<Path>>(path: P, bits: u64) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Self::create(path, bits)
        }
    }

    pub fn create<P: AsRef<Path>>(path: P, bits: u64) -> Result<Self> {
        let bytes = round_up_bits(bits) / 8;
        let mut file = MmapFile::create(path, HEADER_LEN + bytes)?;
        file.append_bytes(&vec![0u8; bytes as usize])?;
        file.sync()?;

        Ok(Bitmap {
            file,
            size: bytes * 8,
            max_one: None,
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = MmapFile::open(path, true)?;
        let size = (file.cursor() - HEADER_LEN) * 8;
        let mut bitmap = Bitmap {
            file,
            size,
            max_one: None,
        };
        bitmap.max_one = bitmap.scan_back(bitmap.size)?;
        Ok(bitmap)
    }

    /// Number of addressable bits.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Largest set bit, `None` when the bitmap is all zeros.
    pub fn max_one_index(&self) -> Option<u64> {
        self.max_one
    }

    /// Set bit `idx`. Returns `false` (and changes nothing) when `idx` is out of range.
    pub fn set(&mut self, idx: u64) -> Result<bool> {
        if idx >= self.size {
            return Ok(false);
        }
        let (offset, mask) = locate(idx);
        let byte = self.byte_at(offset)?;
        self.file.write_bytes(offset, &[byte | mask])?;

        if self.max_one.is_none_or(|max| idx > max) {
            self.max_one = Some(idx);
        }
        Ok(true)
    }

    pub fn clear(&mut self, idx: u64) -> Result<bool> {
        if idx >= self.size {
            return Ok(false);
        }
        let (offset, mask) = locate(idx);
        let byte = self.byte_at(offset)?;
        self.file.write_bytes(offset, &[byte & !mask])?;

        if self.max_one == Some(idx) {
            self.max_one = self.scan_back(idx)?;
        }
        Ok(true)
    }

    pub fn get(&self, idx: u64) -> bool {
        if idx >= self.size {
            return false;
        }
        let (offset, mask) = locate(idx);
        self.byte_at(offset).map(|byte| byte & mask != 0).unwrap_or(false)
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> Result<u64> {
        let bytes = self.file.read_bytes(HEADER_LEN, self.size / 8)?;
        Ok(bytes.iter().map(|b| b.count_ones() as u64).sum())
    }

    /// Grow to hold at least `bits` bits; existing bits are kept.
    pub fn resize(&mut self, bits: u64) -> Result<()> {
        let wanted = round_up_bits(bits);
        if wanted <= self.size {
            return Ok(());
        }
        let extra = (wanted - self.size) / 8;
        self.file.append_bytes(&vec![0u8; extra as usize])?;
        self.size = wanted;
        self.file.sync()
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync()
    }

    pub fn close(self) -> Result<()> {
        self.file.close()
    }

    fn byte_at(&self, offset: u64) -> Result<u8> {
        self.file
            .read_bytes(offset, 1)?
            .first()
            .copied()
            .ok_or_else(|| Error::corrupt("bitmap byte out of range"))
    }

    /// Highest set bit strictly below `end`, walking the tail byte by byte.
    fn scan_back(&self, end: u64) -> Result<Option<u64>> {
        if end == 0 {
            return Ok(None);
        }
        let last_byte = (end - 1) / 8;
        let bytes = self.file.read_bytes(HEADER_LEN, last_byte + 1)?;
        for byte_idx in (0..=last_byte).rev() {
            let mut byte = bytes[byte_idx as usize];
            if byte_idx == last_byte {
                // Only bits below `end` count in the boundary byte.
                let keep = ((end - 1) % 8) + 1;
                byte &= if keep == 8 { 0xFF } else { (1u8 << keep) - 1 };
            }
            if byte != 0 {
                let high = 7 - byte.leading_zeros() as u64;
                return Ok(Some(byte_idx * 8 + high));
            }
        }
        Ok(None)
    }
}

fn round_up_bits(bits: u64) -> u64 {
    bits.max(8).div_ceil(8) * 8
}

fn locate(idx: u64) -> (u64, u8) {
    (HEADER_LEN + idx / 8, 1u8 << (idx % 8))
}
