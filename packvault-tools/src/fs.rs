//! Small filesystem helpers shared by the blob backend and the local caches.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{format_err, Context, Error};

/// Atomically replace `path` with `data`: write to a temporary sibling, then
/// rename over the target. Readers never observe a partial file.
pub fn replace_file<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), Error> {
    let path = path.as_ref();
    let tmp_path = tmp_sibling(path)?;

    let mut file = File::create(&tmp_path)
        .with_context(|| format!("unable to create temporary file {:?}", tmp_path))?;

    let result = file
        .write_all(data)
        .map_err(Error::from)
        .and_then(|_| file.sync_all().map_err(Error::from))
        .and_then(|_| std::fs::rename(&tmp_path, path).map_err(Error::from));

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result.with_context(|| format!("atomic replace of {:?} failed", path))
}

fn tmp_sibling(path: &Path) -> Result<PathBuf, Error> {
    let file_name = path
        .file_name()
        .ok_or_else(|| format_err!("path {:?} has no file name", path))?;
    let mut random = [0u8; 8];
    openssl::rand::rand_bytes(&mut random)?;
    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(file_name);
    tmp_name.push(format!(".tmp_{}", hex::encode(random)));
    Ok(path.with_file_name(tmp_name))
}

/// Read a whole file, mapping "not found" to `None`.
pub fn read_optional_file<P: AsRef<Path>>(path: P) -> Result<Option<Vec<u8>>, Error> {
    let path = path.as_ref();
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("unable to open {:?}", path)),
    };
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .with_context(|| format!("unable to read {:?}", path))?;
    Ok(Some(data))
}

/// `create_dir_all` with a friendlier error message.
pub fn create_path<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let path = path.as_ref();
    std::fs::create_dir_all(path).with_context(|| format!("unable to create path {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target");
        replace_file(&path, b"first").unwrap();
        assert_eq!(read_optional_file(&path).unwrap().unwrap(), b"first");
        replace_file(&path, b"second").unwrap();
        assert_eq!(read_optional_file(&path).unwrap().unwrap(), b"second");
        // no temp litter left behind
        let count = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 1);
    }

    #[test]
    fn read_optional_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_optional_file(dir.path().join("nope")).unwrap().is_none());
    }
}
