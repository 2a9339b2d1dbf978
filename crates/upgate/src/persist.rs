use std::io::Write;
use std::path::Path;

/// Replace `path` with `data` so readers see either the old or the new
/// contents, never a partial write.
///
/// # Errors
/// Returns an error if the temporary file cannot be written or renamed.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    std::fs::create_dir_all(parent)?;

    let mut staged = tempfile::NamedTempFile::new_in(parent)?;
    staged.write_all(data)?;
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|error| error.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::write_atomic;

    #[test]
    fn replaces_existing_file_without_leftovers() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("state.json");
        std::fs::write(&path, b"old").expect("initial file should be written");

        write_atomic(&path, b"new").expect("atomic write should succeed");

        assert_eq!(std::fs::read(&path).expect("file should be readable"), b"new");
        let entries = std::fs::read_dir(temp.path())
            .expect("dir should be readable")
            .count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn creates_missing_parent_directories() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("nested").join("state.json");

        write_atomic(&path, b"{}").expect("atomic write should succeed");

        assert_eq!(std::fs::read(&path).expect("file should be readable"), b"{}");
    }
}
