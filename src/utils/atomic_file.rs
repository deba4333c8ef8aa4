use crate::error::OmnidexResult;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Replace `path` atomically: write a sibling temp file, fsync it, rename.
/// A failure at any point leaves the previous contents of `path` intact.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> OmnidexResult<()> {
    write_atomic_hooked(path, bytes, || Ok(()))
}

/// Same as [`write_atomic`] but runs `before_rename` between the fsync and
/// the rename. Fault-injection tests use the hook to simulate a crash in
/// the window where both the temp file and the old file exist.
pub fn write_atomic_hooked(
    path: &Path,
    bytes: &[u8],
    before_rename: impl FnOnce() -> OmnidexResult<()>,
) -> OmnidexResult<()> {
    let tmp = tmp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(err) = before_rename() {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn tmp_path(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OmnidexError;
    use tempfile::TempDir;

    #[test]
    fn replaces_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
    }

    #[test]
    fn failed_hook_preserves_original() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        write_atomic(&path, b"original").unwrap();
        let result = write_atomic_hooked(&path, b"replacement", || {
            Err(OmnidexError::Internal("injected".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(fs::read(&path).unwrap(), b"original");
        assert!(!tmp_path(&path).exists());
    }
}
