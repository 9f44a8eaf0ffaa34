//! External flash memory.
//!
//! The `Flash` trait is the interface of the SPI flash driver. Erase, write
//! and read are blocking; `read_dma` starts a background transfer into the
//! driver's DMA buffer, which can be collected with `take_dma` once
//! `is_busy` returns false.
//!
//! `MemFlash` keeps the whole flash in memory. Its DMA transfers complete
//! after a configurable number of `is_busy` polls, and the data is copied at
//! completion time, like a real transfer that reads the array while running.

use log::{debug, error, info, warn};

use std::fmt;
use std::fs;

pub const FLASH_ERASED_BYTE: u8 = 0xFF;

pub trait Flash {
    /// Sector size in bytes. Erase always works on whole sectors.
    fn sector_size(&self) -> usize;

    /// Erase the sector containing addr.
    fn erase_sector(&mut self, addr: u32);

    /// Write data starting at addr.
    fn write(&mut self, addr: u32, data: &[u8]);

    /// Read data.len() bytes starting at addr.
    fn read(&mut self, addr: u32, data: &mut [u8]);

    /// Start a background read of len bytes into the DMA buffer.
    fn read_dma(&mut self, addr: u32, len: usize);

    /// True while a background read is running.
    fn is_busy(&mut self) -> bool;

    /// Copy the result of the last finished background read into data.
    ///
    /// Returns false if a transfer is still running.
    fn take_dma(&mut self, data: &mut [u8]) -> bool;
}

/// A flash image had the wrong size.
#[derive(Debug)]
pub struct InvalidImageSize {
    pub expected: usize,
    pub actual: usize,
}

impl fmt::Display for InvalidImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid flash image size {}, expected {}", self.actual, self.expected)
    }
}

impl std::error::Error for InvalidImageSize { }

struct DmaTransfer {
    addr: usize,
    len: usize,
    polls_left: usize,
}

/// In-memory flash with simulated DMA.
pub struct MemFlash {
    data: Vec<u8>,
    sector_size: usize,
    dma_latency: usize,
    dma_buf: Vec<u8>,
    dma_len: usize,
    transfer: Option<DmaTransfer>,
    collisions: usize,
}

impl MemFlash {
    /// Creates an erased flash of the given size.
    ///
    /// ```
    /// use wavesphere::{Flash, MemFlash};
    ///
    /// let mut flash = MemFlash::new(0x20000, 0x10000);
    /// let mut buf = [0u8; 4];
    /// flash.read(0, &mut buf);
    /// assert_eq!(buf, [0xFF; 4]);
    /// ```
    pub fn new(size: usize, sector_size: usize) -> MemFlash {
        MemFlash{
            data: vec![FLASH_ERASED_BYTE; size],
            sector_size,
            dma_latency: 0,
            dma_buf: vec![],
            dma_len: 0,
            transfer: None,
            collisions: 0,
        }
    }

    /// Creates a flash from an existing image.
    pub fn from_image(image: Vec<u8>, expected_size: usize, sector_size: usize) -> Result<MemFlash, InvalidImageSize> {
        if image.len() != expected_size {
            error!("Flash image has {} bytes, expected {}", image.len(), expected_size);
            return Err(InvalidImageSize{expected: expected_size, actual: image.len()});
        }
        let mut flash = MemFlash::new(0, sector_size);
        flash.data = image;
        Ok(flash)
    }

    /// Read a flash image from a file.
    pub fn load_file(filename: &str, expected_size: usize, sector_size: usize) -> Result<MemFlash, ()> {
        info!("Reading flash image [{}]", filename);
        let image = match fs::read(filename) {
            Ok(image) => image,
            Err(e) => {
                error!("Unable to read flash image [{}]: {}", filename, e);
                return Err(());
            }
        };
        MemFlash::from_image(image, expected_size, sector_size).map_err(|_| ())
    }

    /// Write the flash image to a file.
    pub fn save_file(&self, filename: &str) -> Result<(), ()> {
        info!("Writing flash image [{}]", filename);
        fs::write(filename, &self.data).map_err(|e| {
            error!("Unable to write flash image [{}]: {}", filename, e);
        })
    }

    /// Number of is_busy polls a DMA transfer takes to complete.
    pub fn set_dma_latency(&mut self, polls: usize) {
        self.dma_latency = polls;
    }

    /// Number of erase or write operations issued while a DMA transfer was
    /// running.
    pub fn dma_collisions(&self) -> usize {
        self.collisions
    }

    pub fn image(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    // Returns the byte range for an access, or None if it is out of bounds.
    fn range(&self, addr: u32, len: usize) -> Option<std::ops::Range<usize>> {
        let start = addr as usize;
        let end = start.checked_add(len)?;
        if end > self.data.len() {
            warn!("Flash access {:#x}+{} out of range", start, len);
            return None;
        }
        Some(start..end)
    }

    fn check_collision(&mut self, op: &str) {
        if self.transfer.is_some() {
            error!("Flash {} while DMA transfer is running", op);
            self.collisions += 1;
        }
    }

    fn finish_transfer(&mut self) {
        if let Some(t) = self.transfer.take() {
            if self.dma_buf.len() < t.len {
                self.dma_buf.resize(t.len, 0);
            }
            self.dma_buf[..t.len].copy_from_slice(&self.data[t.addr..t.addr + t.len]);
            self.dma_len = t.len;
        }
    }
}

impl Flash for MemFlash {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn erase_sector(&mut self, addr: u32) {
        self.check_collision("erase");
        let start = (addr as usize / self.sector_size) * self.sector_size;
        if let Some(range) = self.range(start as u32, self.sector_size) {
            debug!("Erasing sector at {:#x}", start);
            for b in &mut self.data[range] {
                *b = FLASH_ERASED_BYTE;
            }
        }
    }

    fn write(&mut self, addr: u32, data: &[u8]) {
        self.check_collision("write");
        if let Some(range) = self.range(addr, data.len()) {
            self.data[range].copy_from_slice(data);
        }
    }

    fn read(&mut self, addr: u32, data: &mut [u8]) {
        match self.range(addr, data.len()) {
            Some(range) => data.copy_from_slice(&self.data[range]),
            None => {
                for b in data.iter_mut() {
                    *b = FLASH_ERASED_BYTE;
                }
            }
        }
    }

    fn read_dma(&mut self, addr: u32, len: usize) {
        if self.transfer.is_some() {
            warn!("Starting DMA read while previous transfer is running");
        }
        let addr = match self.range(addr, len) {
            Some(range) => range.start,
            None => {
                self.dma_len = 0;
                return;
            }
        };
        self.transfer = Some(DmaTransfer{addr, len, polls_left: self.dma_latency});
        if self.dma_latency == 0 {
            self.finish_transfer();
        }
    }

    fn is_busy(&mut self) -> bool {
        let done = match self.transfer.as_mut() {
            None => return false,
            Some(t) if t.polls_left > 0 => {
                t.polls_left -= 1;
                false
            }
            Some(_) => true,
        };
        if done {
            self.finish_transfer();
            return false;
        }
        true
    }

    fn take_dma(&mut self, data: &mut [u8]) -> bool {
        if self.transfer.is_some() {
            return false;
        }
        let n = data.len().min(self.dma_len);
        data[..n].copy_from_slice(&self.dma_buf[..n]);
        true
    }
}

// ----------------------------------------------
//                  Unit tests
// ----------------------------------------------

#[test]
fn erase_resets_whole_sector() {
    let mut flash = MemFlash::new(0x400, 0x100);
    flash.write(0x100, &[1, 2, 3]);
    flash.write(0x1FF, &[4]);
    flash.write(0x200, &[5]);
    flash.erase_sector(0x180);
    let mut buf = [0u8; 0x100];
    flash.read(0x100, &mut buf);
    assert!(buf.iter().all(|b| *b == FLASH_ERASED_BYTE));
    let mut buf = [0u8; 1];
    flash.read(0x200, &mut buf);
    assert_eq!(buf[0], 5);
}

#[test]
fn out_of_range_access_is_ignored() {
    let mut flash = MemFlash::new(0x100, 0x100);
    flash.write(0xFE, &[1, 2, 3]);
    let mut buf = [0u8; 4];
    flash.read(0xFE, &mut buf);
    assert_eq!(buf, [0xFF; 4]);
}

#[test]
fn dma_completes_after_latency() {
    let mut flash = MemFlash::new(0x100, 0x100);
    flash.write(0x10, &[7, 8, 9]);
    flash.set_dma_latency(2);
    flash.read_dma(0x10, 3);
    let mut buf = [0u8; 3];
    assert!(!flash.take_dma(&mut buf));
    assert!(flash.is_busy());
    assert!(flash.is_busy());
    assert!(!flash.is_busy());
    assert!(flash.take_dma(&mut buf));
    assert_eq!(buf, [7, 8, 9]);
}

#[test]
fn writes_during_dma_are_counted() {
    let mut flash = MemFlash::new(0x100, 0x100);
    flash.set_dma_latency(5);
    flash.read_dma(0, 16);
    flash.write(0, &[1]);
    assert_eq!(flash.dma_collisions(), 1);
    while flash.is_busy() {}
    flash.write(0, &[1]);
    assert_eq!(flash.dma_collisions(), 1);
}

#[test]
fn image_size_is_checked() {
    let result = MemFlash::from_image(vec![0; 10], 20, 0x100);
    assert!(matches!(result, Err(InvalidImageSize{expected: 20, actual: 10})));
    assert!(MemFlash::from_image(vec![0; 20], 20, 0x100).is_ok());
}
