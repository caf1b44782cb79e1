//! Durable filesystem helpers.
//!
//! Every state change in the protocol must be durable before any externally
//! observable action that depends on it, so plain writes and deletes are
//! not enough: data is `fsync`ed, and creations/removals are followed by an
//! `fsync` of the containing directory.
//!
//! These are synchronous functions; async callers run them inside
//! `tokio::task::spawn_blocking`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Flush directory metadata so a created or removed entry survives a crash.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Create `dir` (and parents) if missing, durably.
pub fn create_dir_durable(dir: &Path) -> io::Result<()> {
    if dir.exists() {
        return Ok(());
    }
    fs::create_dir_all(dir)?;
    if let Some(parent) = dir.parent()
        && !parent.as_os_str().is_empty()
    {
        sync_dir(parent)?;
    }
    sync_dir(dir)
}

/// Write `bytes` to `path`, creating parent directories, and `fsync` both
/// the file and its directory before returning.
pub fn write_durable(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_durable(parent)?;
    }
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Remove `path` if it exists, and make the removal durable.
///
/// A missing file is a no-op, which keeps retried Phase II deletions
/// idempotent.
pub fn remove_durable(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Open `path` for durable appending, creating parent directories.
pub fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_durable(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Append `line` (plus a newline) to `file` and `fsync` it.
pub fn append_line(file: &mut File, line: &str) -> io::Result<()> {
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_and_remove_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/composite.jpg");

        write_durable(&path, b"pixels").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"pixels");

        remove_durable(&path).unwrap();
        assert!(!path.exists());
        // Removing again is a no-op.
        remove_durable(&path).unwrap();
    }

    #[test]
    fn append_accumulates_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log/log.txt");

        let mut file = open_append(&path).unwrap();
        append_line(&mut file, "one").unwrap();
        append_line(&mut file, "two").unwrap();
        drop(file);

        let mut file = open_append(&path).unwrap();
        append_line(&mut file, "three").unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "one\ntwo\nthree\n");
    }
}
