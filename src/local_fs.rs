//! Caller-side file access through capability handles.

use std::io;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};

/// Opens the directory holding `path` and returns it with the final path
/// component.
pub(crate) fn open_parent(path: &Utf8Path) -> io::Result<(Dir, String)> {
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path has no file name: {path}"),
        )
    })?;
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
    Ok((dir, name.to_owned()))
}

/// Returns `true` when `path` names an existing directory.
pub(crate) fn is_dir(path: &Utf8Path) -> bool {
    Dir::open_ambient_dir(path, ambient_authority()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    #[test]
    fn parent_of_nested_path_is_opened() {
        let tmp = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 path");
        let base = Dir::open_ambient_dir(&root, ambient_authority()).expect("open temp dir");
        base.create_dir_all("nested").expect("mkdir");
        base.write("nested/data.bin", b"abc").expect("write");

        let (dir, name) = open_parent(&root.join("nested/data.bin")).expect("open parent");

        assert_eq!(name, "data.bin");
        assert_eq!(dir.read(&name).expect("read"), b"abc");
        assert!(is_dir(&root.join("nested")));
        assert!(!is_dir(&root.join("nested/data.bin")));
    }

    #[test]
    fn root_has_no_file_name() {
        let err = open_parent(Utf8Path::new("/")).expect_err("root has no file name");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
