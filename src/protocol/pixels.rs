//! Framed reader for the binary pixel stream sent back by a disposable VM.
//!
//! ```text
//! u16 N                                  page count (big-endian)
//! N × ( u16 width | u16 height | width*height*3 bytes )
//! <end of stream>
//! ```
//!
//! There are no delimiters: every frame length is implied by the two fields
//! before it. Each field is validated before it is used to size a read, and
//! a stream that ends early is an error, never a short page.

use crate::error::{ProtocolError, SafePdfError};
use crate::pipeline::pages::PageRaster;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Reads the page count and page frames from an untrusted stream.
pub struct PixelStreamReader<R> {
    reader: R,
    max_dimension: u16,
}

impl<R: AsyncRead + Unpin> PixelStreamReader<R> {
    pub fn new(reader: R, max_dimension: u16) -> Self {
        Self {
            reader,
            max_dimension,
        }
    }

    /// Read the page count. Zero pages is a protocol error.
    pub async fn read_page_count(&mut self) -> Result<usize, SafePdfError> {
        let n = self.read_u16("page count").await?;
        if n == 0 {
            return Err(ProtocolError::ZeroPages.into());
        }
        Ok(usize::from(n))
    }

    /// Read page `index` (1-based): its geometry, then exactly
    /// `width*height*3` pixel bytes.
    pub async fn read_page(&mut self, index: usize) -> Result<PageRaster, SafePdfError> {
        let width = self.read_u16(&format!("page {index} width")).await?;
        let height = self.read_u16(&format!("page {index} height")).await?;

        let max = self.max_dimension;
        if !(1..=max).contains(&width) || !(1..=max).contains(&height) {
            return Err(ProtocolError::DimensionOutOfBounds {
                page: index,
                width: u64::from(width),
                height: u64::from(height),
                max,
            }
            .into());
        }

        let expected = PageRaster::byte_len(width, height);
        // The buffer grows with the data actually received rather than the
        // declared size.
        let mut pixels = Vec::new();
        let received = (&mut self.reader)
            .take(expected)
            .read_to_end(&mut pixels)
            .await
            .map_err(|e| SafePdfError::io(format!("reading page {index} pixels"), e))?
            as u64;
        if received != expected {
            return Err(ProtocolError::Truncated {
                what: format!("page {index} pixels"),
                expected,
                received,
            }
            .into());
        }

        Ok(PageRaster {
            index,
            width,
            height,
            pixels,
        })
    }

    /// Confirm the stream ends after `pages` pages.
    pub async fn expect_end(&mut self, pages: usize) -> Result<(), SafePdfError> {
        let mut probe = [0u8; 1];
        let n = self
            .reader
            .read(&mut probe)
            .await
            .map_err(|e| SafePdfError::io("reading end of pixel stream", e))?;
        if n != 0 {
            return Err(ProtocolError::TrailingData { pages }.into());
        }
        Ok(())
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    async fn read_u16(&mut self, what: &str) -> Result<u16, SafePdfError> {
        let mut buf = [0u8; 2];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .reader
                .read(&mut buf[filled..])
                .await
                .map_err(|e| SafePdfError::io(format!("reading {what}"), e))?;
            if n == 0 {
                return Err(ProtocolError::Truncated {
                    what: what.to_string(),
                    expected: buf.len() as u64,
                    received: filled as u64,
                }
                .into());
            }
            filled += n;
        }
        Ok(u16::from_be_bytes(buf))
    }
}
