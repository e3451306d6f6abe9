//! Move the reassembled PDF to the caller's output path.
//!
//! The caller-visible path is only ever written with a complete file: the
//! produced PDF is renamed into place, or, across filesystems, copied to a
//! temporary file beside the destination and persisted atomically.

use crate::error::{ProtocolError, SafePdfError};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The only file stage 2 may leave in its output directory.
pub const SAFE_OUTPUT_NAME: &str = "safe-output-compressed.pdf";

/// Return the produced PDF, checking that it is the only entry in `safe_dir`.
pub fn expect_single_output(safe_dir: &Path) -> Result<PathBuf, SafePdfError> {
    let entries: Vec<_> = std::fs::read_dir(safe_dir)
        .map_err(|e| SafePdfError::io(format!("listing '{}'", safe_dir.display()), e))?
        .collect::<Result<_, _>>()
        .map_err(|e| SafePdfError::io(format!("listing '{}'", safe_dir.display()), e))?;

    let produced = safe_dir.join(SAFE_OUTPUT_NAME);
    let only_expected = entries.len() == 1 && entries[0].file_name() == SAFE_OUTPUT_NAME;
    if !only_expected || !produced.is_file() {
        return Err(ProtocolError::UnexpectedStageOutput {
            found: entries.len(),
            expected: SAFE_OUTPUT_NAME.to_string(),
        }
        .into());
    }
    Ok(produced)
}

/// Remove a file left at `dest` by an earlier run.
pub fn clear_stale_output(dest: &Path) -> Result<(), SafePdfError> {
    match std::fs::remove_file(dest) {
        Ok(()) => {
            debug!("Removed stale output '{}'", dest.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SafePdfError::OutputWriteFailed {
            path: dest.to_path_buf(),
            source,
        }),
    }
}

/// Replace `dest` with `produced`.
pub fn move_into_place(produced: &Path, dest: &Path) -> Result<(), SafePdfError> {
    clear_stale_output(dest)?;

    if let Err(e) = std::fs::rename(produced, dest) {
        debug!(
            "rename '{}' -> '{}' failed ({}); copying instead",
            produced.display(),
            dest.display(),
            e
        );
        copy_atomically(produced, dest).map_err(|source| SafePdfError::OutputWriteFailed {
            path: dest.to_path_buf(),
            source,
        })?;
    }

    info!("Safe PDF written to '{}'", dest.display());
    Ok(())
}

fn copy_atomically(src: &Path, dest: &Path) -> std::io::Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no parent"))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    let mut reader = std::fs::File::open(src)?;
    std::io::copy(&mut reader, &mut tmp)?;
    tmp.as_file_mut().flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_expected_file_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SAFE_OUTPUT_NAME), b"%PDF").unwrap();
        let p = expect_single_output(dir.path()).unwrap();
        assert!(p.ends_with(SAFE_OUTPUT_NAME));
    }

    #[test]
    fn empty_output_dir_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            expect_single_output(dir.path()),
            Err(SafePdfError::Protocol(ProtocolError::UnexpectedStageOutput { found: 0, .. }))
        ));
    }

    #[test]
    fn extra_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SAFE_OUTPUT_NAME), b"%PDF").unwrap();
        std::fs::write(dir.path().join("payload.js"), b"alert(1)").unwrap();
        assert!(matches!(
            expect_single_output(dir.path()),
            Err(SafePdfError::Protocol(ProtocolError::UnexpectedStageOutput { found: 2, .. }))
        ));
    }

    #[test]
    fn wrong_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("output.pdf"), b"%PDF").unwrap();
        assert!(expect_single_output(dir.path()).is_err());
    }

    #[test]
    fn directory_named_like_output_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(SAFE_OUTPUT_NAME)).unwrap();
        assert!(expect_single_output(dir.path()).is_err());
    }

    #[test]
    fn replaces_existing_destination() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let produced = work.path().join(SAFE_OUTPUT_NAME);
        std::fs::write(&produced, b"new").unwrap();
        let dest = out.path().join("doc-safe.pdf");
        std::fs::write(&dest, b"stale").unwrap();

        move_into_place(&produced, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"new");
        assert!(!produced.exists());
    }

    #[test]
    fn copy_fallback_writes_complete_file() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let src = work.path().join("a.pdf");
        std::fs::write(&src, vec![9u8; 100_000]).unwrap();
        let dest = out.path().join("b.pdf");

        copy_atomically(&src, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap().len(), 100_000);
        // Only the destination remains; the temporary file was persisted.
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 1);
    }

    #[test]
    fn clearing_missing_output_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        clear_stale_output(&dir.path().join("nothing.pdf")).unwrap();
    }
}
