//! Crash-safe file replacement.

use std::{
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
};

/// Sibling `path` is staged in before being renamed over it: `record.json` -> `record.json.tmp`.
pub(crate) fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Replace the content of `path`. Readers see either the old or the new file, never a torn one.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = staging_path(path);
    let mut file = File::create(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)
}
