//! Tar helpers for build contexts and copied-out artifacts.

use crossmatrix_core::Result;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

/// Pack a build context directory into an uncompressed tar stream.
pub fn pack_dir(dir: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;
    Ok(builder.into_inner()?)
}

/// Unpack a tar stream into `dest`, returning the regular files written.
///
/// Entries that would escape `dest` are skipped by `unpack_in`.
pub fn unpack_files<R: Read>(reader: R, dest: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(reader);
    let mut written = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = entry.path()?.into_owned();
        let is_file = entry.header().entry_type().is_file();
        if entry.unpack_in(dest)? && is_file {
            written.push(dest.join(normalize(&rel)));
        }
    }

    written.sort();
    Ok(written)
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}
