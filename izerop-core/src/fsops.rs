//! Atomic filesystem operations.
//!
//! Every write to a user-visible path goes through a same-directory temp file
//! followed by a rename, so readers never observe a half-written file.
//! Cross-device renames fall back to copy + unlink.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Suffix of in-flight temp files. The watcher and the push walk both treat
/// paths carrying it as noise.
pub const TMP_SUFFIX: &str = ".izerop-tmp";

/// Marker carried by conflict sidecar files. Sidecars are never re-uploaded.
pub const CONFLICT_MARKER: &str = ".conflict";

/// Temp-file twin of `path`, in the same directory.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(TMP_SUFFIX);
    PathBuf::from(os)
}

/// Sidecar path for the losing version of a divergent edit:
/// `a.txt` becomes `a.conflict.txt`, extension-less `a` becomes `a.conflict`.
pub fn conflict_path(path: &Path) -> PathBuf {
    match (path.file_stem(), path.extension()) {
        (Some(stem), Some(ext)) => {
            let mut name = stem.to_os_string();
            name.push(CONFLICT_MARKER);
            name.push(".");
            name.push(ext);
            path.with_file_name(name)
        }
        _ => {
            let mut os = path.as_os_str().to_os_string();
            os.push(CONFLICT_MARKER);
            PathBuf::from(os)
        }
    }
}

/// Renames `tmp` over `dest`. When the rename fails (cross-device moves),
/// falls back to a byte copy followed by unlink of the temp.
pub fn install(tmp: &Path, dest: &Path) -> io::Result<()> {
    if let Err(rename_err) = fs::rename(tmp, dest) {
        let copied = fs::copy(tmp, dest);
        let _ = fs::remove_file(tmp);
        copied.map_err(|_| rename_err)?;
    }
    Ok(())
}

/// Writes `bytes` to `dest` atomically via the temp-file pattern, with a
/// best-effort fsync before the rename.
pub fn write_atomic(dest: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = tmp_path(dest);
    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        let _ = file.sync_all();
        drop(file);
        install(&tmp, dest)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tmp_path_appends_suffix() {
        assert_eq!(
            tmp_path(Path::new("docs/a.txt")),
            PathBuf::from("docs/a.txt.izerop-tmp")
        );
    }

    #[test]
    fn conflict_path_keeps_extension() {
        assert_eq!(
            conflict_path(Path::new("docs/a.txt")),
            PathBuf::from("docs/a.conflict.txt")
        );
        assert_eq!(
            conflict_path(Path::new("notes/todo")),
            PathBuf::from("notes/todo.conflict")
        );
    }

    #[test]
    fn write_atomic_replaces_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("f.bin");
        fs::write(&dest, b"old").unwrap();

        write_atomic(&dest, b"new contents").unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"new contents");
        assert!(!tmp_path(&dest).exists());
    }
}
