//! Page rasters and the on-disk layout shared by stage 1 and stage 2.
//!
//! Stage 1 leaves one triple of files per page in the pixel directory:
//!
//! ```text
//! page-1.width   decimal text
//! page-1.height  decimal text
//! page-1.rgb     width * height * 3 raw bytes
//! page-2.width
//! ...
//! ```
//!
//! Whoever produced that directory is untrusted. [`validate_pixel_dir`]
//! checks the whole layout before stage 2 is allowed to read it.

use crate::error::{ProtocolError, SafePdfError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Bytes per pixel (24-bit RGB).
pub const BYTES_PER_PIXEL: u64 = 3;

/// Default upper bound for page width and height.
pub const DEFAULT_MAX_DIMENSION: u16 = 10_000;

/// Geometry files are a handful of digits; anything larger is hostile.
const MAX_GEOMETRY_FILE_LEN: u64 = 16;

static RE_PAGE_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^page-([0-9]{1,9})\.(width|height|rgb)$").unwrap());

/// One decoded page: 1-based index, geometry and RGB pixel data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRaster {
    pub index: usize,
    pub width: u16,
    pub height: u16,
    pub pixels: Vec<u8>,
}

impl PageRaster {
    /// Number of pixel bytes a page of this geometry carries.
    pub fn byte_len(width: u16, height: u16) -> u64 {
        // u16 * u16 * 3 always fits in a u64.
        u64::from(width) * u64::from(height) * BYTES_PER_PIXEL
    }

    /// Write the page's width, height and rgb files into `dir`.
    pub async fn persist(&self, dir: &Path) -> Result<(), SafePdfError> {
        let [w, h, rgb] = page_paths(dir, self.index);
        write(&w, self.width.to_string().as_bytes()).await?;
        write(&h, self.height.to_string().as_bytes()).await?;
        write(&rgb, &self.pixels).await?;
        debug!(
            "Persisted page {} ({}x{}) to '{}'",
            self.index,
            self.width,
            self.height,
            dir.display()
        );
        Ok(())
    }
}

async fn write(path: &Path, data: &[u8]) -> Result<(), SafePdfError> {
    tokio::fs::write(path, data)
        .await
        .map_err(|e| SafePdfError::io(format!("writing '{}'", path.display()), e))
}

/// `[width, height, rgb]` paths for page `index` inside `dir`.
pub fn page_paths(dir: &Path, index: usize) -> [PathBuf; 3] {
    ["width", "height", "rgb"].map(|ext| dir.join(format!("page-{index}.{ext}")))
}

#[derive(Default)]
struct PageFiles {
    width: bool,
    height: bool,
    rgb: bool,
}

/// Check a stage-1 pixel directory and return its page count.
///
/// Every page from 1 to N must have all three files, geometry within
/// `1..=max_dimension`, and an `.rgb` file of exactly `width*height*3` bytes.
/// Files that do not follow the page naming scheme are ignored.
pub async fn validate_pixel_dir(dir: &Path, max_dimension: u16) -> Result<usize, SafePdfError> {
    let mut pages: BTreeMap<usize, PageFiles> = BTreeMap::new();

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| SafePdfError::io(format!("listing '{}'", dir.display()), e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| SafePdfError::io(format!("listing '{}'", dir.display()), e))?
    {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(caps) = RE_PAGE_FILE.captures(&name) else {
            warn!("Ignoring unexpected stage output '{}'", name);
            continue;
        };
        let Ok(index) = caps[1].parse::<usize>() else {
            continue;
        };
        let files = pages.entry(index).or_default();
        match &caps[2] {
            "width" => files.width = true,
            "height" => files.height = true,
            _ => files.rgb = true,
        }
    }

    if pages.is_empty() {
        return Err(ProtocolError::ZeroPages.into());
    }

    let count = pages.len();
    for (expected, (&index, files)) in (1..=count).zip(pages.iter()) {
        if index != expected {
            // Numbering has a gap: the lowest missing page is `expected`.
            return Err(ProtocolError::MissingPageFile {
                page: expected,
                file: format!("page-{expected}.rgb"),
            }
            .into());
        }
        for (present, ext) in [(files.width, "width"), (files.height, "height"), (files.rgb, "rgb")]
        {
            if !present {
                return Err(ProtocolError::MissingPageFile {
                    page: index,
                    file: format!("page-{index}.{ext}"),
                }
                .into());
            }
        }
        validate_page(dir, index, max_dimension).await?;
    }

    debug!("Pixel directory '{}' holds {} page(s)", dir.display(), count);
    Ok(count)
}

async fn validate_page(dir: &Path, index: usize, max: u16) -> Result<(), SafePdfError> {
    let [w_path, h_path, rgb_path] = page_paths(dir, index);
    let width = read_dimension(&w_path, index, "width").await?;
    let height = read_dimension(&h_path, index, "height").await?;

    if !(1..=u64::from(max)).contains(&width) || !(1..=u64::from(max)).contains(&height) {
        return Err(ProtocolError::DimensionOutOfBounds {
            page: index,
            width,
            height,
            max,
        }
        .into());
    }

    let expected = width * height * BYTES_PER_PIXEL;
    let actual = file_len(&rgb_path).await?;
    if actual != expected {
        return Err(ProtocolError::PixelLengthMismatch {
            page: index,
            expected,
            actual,
        }
        .into());
    }
    Ok(())
}

async fn read_dimension(path: &Path, page: usize, field: &'static str) -> Result<u64, SafePdfError> {
    let len = file_len(path).await?;
    if len > MAX_GEOMETRY_FILE_LEN {
        return Err(ProtocolError::MalformedGeometry {
            page,
            field,
            value: format!("<{len} bytes>"),
        }
        .into());
    }

    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| SafePdfError::io(format!("reading '{}'", path.display()), e))?;
    let text = String::from_utf8_lossy(&raw);
    text.trim().parse::<u64>().map_err(|_| {
        ProtocolError::MalformedGeometry {
            page,
            field,
            value: text.trim().to_string(),
        }
        .into()
    })
}

async fn file_len(path: &Path) -> Result<u64, SafePdfError> {
    let meta = tokio::fs::symlink_metadata(path)
        .await
        .map_err(|e| SafePdfError::io(format!("inspecting '{}'", path.display()), e))?;
    if !meta.is_file() {
        return Err(SafePdfError::io(
            format!("inspecting '{}'", path.display()),
            std::io::Error::new(std::io::ErrorKind::InvalidData, "not a regular file"),
        ));
    }
    Ok(meta.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(index: usize, width: u16, height: u16) -> PageRaster {
        let len = PageRaster::byte_len(width, height) as usize;
        PageRaster {
            index,
            width,
            height,
            pixels: vec![0xAB; len],
        }
    }

    #[test]
    fn byte_len_at_bounds() {
        assert_eq!(PageRaster::byte_len(1, 1), 3);
        assert_eq!(PageRaster::byte_len(10_000, 10_000), 300_000_000);
        assert_eq!(PageRaster::byte_len(u16::MAX, u16::MAX), 12_884_508_675);
    }

    #[tokio::test]
    async fn persisted_pages_validate() {
        let dir = tempfile::tempdir().unwrap();
        for i in 1..=3 {
            page(i, 4, 2).persist(dir.path()).await.unwrap();
        }
        assert_eq!(
            std::fs::read_to_string(dir.path().join("page-2.width")).unwrap(),
            "4"
        );
        assert_eq!(
            std::fs::metadata(dir.path().join("page-3.rgb")).unwrap().len(),
            24
        );
        let n = validate_pixel_dir(dir.path(), DEFAULT_MAX_DIMENSION)
            .await
            .unwrap();
        assert_eq!(n, 3);
    }

    #[tokio::test]
    async fn empty_dir_is_zero_pages() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate_pixel_dir(dir.path(), 100).await.unwrap_err();
        assert!(matches!(err, SafePdfError::Protocol(ProtocolError::ZeroPages)));
    }

    #[tokio::test]
    async fn gap_in_numbering_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        page(1, 1, 1).persist(dir.path()).await.unwrap();
        page(3, 1, 1).persist(dir.path()).await.unwrap();
        let err = validate_pixel_dir(dir.path(), 100).await.unwrap_err();
        assert!(matches!(
            err,
            SafePdfError::Protocol(ProtocolError::MissingPageFile { page: 2, .. })
        ));
    }

    #[tokio::test]
    async fn missing_rgb_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        page(1, 2, 2).persist(dir.path()).await.unwrap();
        std::fs::remove_file(dir.path().join("page-1.rgb")).unwrap();
        let err = validate_pixel_dir(dir.path(), 100).await.unwrap_err();
        match err {
            SafePdfError::Protocol(ProtocolError::MissingPageFile { page, file }) => {
                assert_eq!(page, 1);
                assert_eq!(file, "page-1.rgb");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn oversized_geometry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("page-1.width"), "20000").unwrap();
        std::fs::write(dir.path().join("page-1.height"), "1").unwrap();
        std::fs::write(dir.path().join("page-1.rgb"), b"").unwrap();
        let err = validate_pixel_dir(dir.path(), DEFAULT_MAX_DIMENSION)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SafePdfError::Protocol(ProtocolError::DimensionOutOfBounds { width: 20_000, .. })
        ));
    }

    #[tokio::test]
    async fn zero_width_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("page-1.width"), "0").unwrap();
        std::fs::write(dir.path().join("page-1.height"), "5").unwrap();
        std::fs::write(dir.path().join("page-1.rgb"), b"").unwrap();
        let err = validate_pixel_dir(dir.path(), 100).await.unwrap_err();
        assert!(matches!(
            err,
            SafePdfError::Protocol(ProtocolError::DimensionOutOfBounds { width: 0, .. })
        ));
    }

    #[tokio::test]
    async fn non_numeric_geometry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("page-1.width"), "12px").unwrap();
        std::fs::write(dir.path().join("page-1.height"), "5").unwrap();
        std::fs::write(dir.path().join("page-1.rgb"), b"").unwrap();
        let err = validate_pixel_dir(dir.path(), 100).await.unwrap_err();
        assert!(matches!(
            err,
            SafePdfError::Protocol(ProtocolError::MalformedGeometry { field: "width", .. })
        ));
    }

    #[tokio::test]
    async fn oversized_geometry_file_is_not_read() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("page-1.width"), "1".repeat(4096)).unwrap();
        std::fs::write(dir.path().join("page-1.height"), "1").unwrap();
        std::fs::write(dir.path().join("page-1.rgb"), b"").unwrap();
        let err = validate_pixel_dir(dir.path(), 100).await.unwrap_err();
        match err {
            SafePdfError::Protocol(ProtocolError::MalformedGeometry { value, .. }) => {
                assert_eq!(value, "<4096 bytes>")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn short_rgb_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        page(1, 2, 2).persist(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("page-1.rgb"), [0u8; 11]).unwrap();
        let err = validate_pixel_dir(dir.path(), 100).await.unwrap_err();
        assert!(matches!(
            err,
            SafePdfError::Protocol(ProtocolError::PixelLengthMismatch {
                expected: 12,
                actual: 11,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn unrelated_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        page(1, 1, 1).persist(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hi").unwrap();
        assert_eq!(validate_pixel_dir(dir.path(), 100).await.unwrap(), 1);
    }
}
