//! Upload ingest
//!
//! Network uploads arrive in chunks of whatever size the network stack
//! produced. [`UploadIngest`] buffers them in a fixed FIFO and hands the
//! session page-sized slices, so chunk boundaries never have to line up
//! with page boundaries and the whole image never has to sit in memory.

use crate::error::{Error, Result};
use crate::protocol::MAX_PAGE_SIZE;
use heapless::{Deque, Vec};

/// Bytes buffered between the network and the peer
pub const INGEST_CAPACITY: usize = 1024;

/// Lifecycle of one upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// Still accepting bytes
    Receiving,
    /// All declared bytes arrived
    Complete,
    /// Cancelled, or ended short
    Aborted,
}

/// One page worth of image data and the address it belongs at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageBuffer {
    /// Page-aligned byte address in peer flash
    pub address: u32,
    data: Vec<u8, MAX_PAGE_SIZE>,
    payload: usize,
}

impl PageBuffer {
    /// Page contents, always exactly one page long
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of image bytes in this page, excluding zero padding
    pub fn payload_len(&self) -> usize {
        self.payload
    }
}

/// Receives chunked upload bytes and slices them into pages
#[derive(Debug)]
pub struct UploadIngest {
    state: UploadState,
    bytes_total: usize,
    bytes_received: usize,
    fifo: Deque<u8, INGEST_CAPACITY>,
}

impl UploadIngest {
    /// Open an upload that will deliver `total` bytes
    pub fn begin(total: usize) -> Self {
        log::debug!("ingest: Receiving {} bytes", total);
        Self {
            state: UploadState::Receiving,
            bytes_total: total,
            bytes_received: 0,
            fifo: Deque::new(),
        }
    }

    /// Offer a chunk of upload bytes
    ///
    /// Returns how many bytes were taken. Fewer than `bytes.len()` means
    /// the buffer is full; offer the rest again after the session has
    /// written a page.
    pub fn chunk(&mut self, bytes: &[u8]) -> Result<usize> {
        match self.state {
            UploadState::Receiving => {}
            UploadState::Aborted => return Err(Error::UploadAborted),
            UploadState::Complete => return Err(Error::UploadOverrun),
        }

        if self.bytes_received + bytes.len() > self.bytes_total {
            log::warn!(
                "ingest: Chunk of {} bytes overruns declared size {}",
                bytes.len(),
                self.bytes_total
            );
            return Err(Error::UploadOverrun);
        }

        let mut taken = 0;
        for &byte in bytes {
            if self.fifo.push_back(byte).is_err() {
                break;
            }
            taken += 1;
        }
        self.bytes_received += taken;
        Ok(taken)
    }

    /// Finish the upload
    ///
    /// Ending before every declared byte arrived aborts the upload.
    pub fn end(&mut self) -> Result<()> {
        match self.state {
            UploadState::Receiving if self.bytes_received == self.bytes_total => {
                self.state = UploadState::Complete;
                Ok(())
            }
            UploadState::Receiving => {
                log::warn!(
                    "ingest: Upload ended after {} of {} bytes",
                    self.bytes_received,
                    self.bytes_total
                );
                self.abort();
                Err(Error::UploadAborted)
            }
            UploadState::Complete => Ok(()),
            UploadState::Aborted => Err(Error::UploadAborted),
        }
    }

    /// Cancel the upload and drop anything buffered
    pub fn abort(&mut self) {
        self.state = UploadState::Aborted;
        self.fifo.clear();
    }

    /// Take the next page if one is ready
    ///
    /// A page is ready once a full page is buffered, or once the upload is
    /// complete and a final partial page remains, which is zero padded.
    pub fn next_page(&mut self, page_size: usize, address: u32) -> Option<PageBuffer> {
        let page_size = page_size.min(MAX_PAGE_SIZE);
        let ready = match self.state {
            UploadState::Receiving => self.fifo.len() >= page_size,
            UploadState::Complete => !self.fifo.is_empty(),
            UploadState::Aborted => false,
        };
        if !ready {
            return None;
        }

        let mut data = Vec::new();
        while data.len() < page_size {
            match self.fifo.pop_front() {
                Some(byte) => {
                    let _ = data.push(byte);
                }
                None => break,
            }
        }
        let payload = data.len();
        let _ = data.resize(page_size, 0x00);
        if payload < page_size {
            log::debug!(
                "ingest: Final page at 0x{:04X} padded from {} to {} bytes",
                address,
                payload,
                page_size
            );
        }

        Some(PageBuffer {
            address,
            data,
            payload,
        })
    }

    /// Whether every byte has arrived and been handed out as pages
    pub fn is_drained(&self) -> bool {
        self.state == UploadState::Complete && self.fifo.is_empty()
    }

    /// Upload state
    pub fn state(&self) -> UploadState {
        self.state
    }

    /// Declared upload size
    pub fn bytes_total(&self) -> usize {
        self.bytes_total
    }

    /// Bytes accepted so far
    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    /// Bytes accepted but not yet handed out as pages
    pub fn buffered(&self) -> usize {
        self.fifo.len()
    }
}
