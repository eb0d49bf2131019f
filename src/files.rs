use log::info;
use regex::Regex;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum Error {
    #[error("copy {src} to {dst}: {err}")]
    Copy {
        src: PathBuf,
        dst: PathBuf,
        err: std::io::Error,
    },

    #[error("walk {0}: {1}")]
    Walk(PathBuf, walkdir::Error),

    #[error("{path}: {err}")]
    Io { path: PathBuf, err: std::io::Error },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |err| Error::Io {
        path: path.to_path_buf(),
        err,
    }
}

/// Recursively copy `src` to `dst`, keeping symlinks as links.
pub fn copy_dir(src: &Path, dst: &Path) -> Result<(), Error> {
    copy_dir_filtered(src, dst, |_| true)
}

/// Recursively copy `src` to `dst`, skipping files for which `keep` returns false.
/// Directories are always created.
pub fn copy_dir_filtered<F>(src: &Path, dst: &Path, keep: F) -> Result<(), Error>
where
    F: Fn(&Path) -> bool,
{
    info!("Copying {} -> {}", src.display(), dst.display());
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|err| Error::Walk(src.to_path_buf(), err))?;
        let Ok(rel) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(rel);
        let file_type = entry.file_type();
        let copy_err = |err| Error::Copy {
            src: entry.path().to_path_buf(),
            dst: target.clone(),
            err,
        };
        if file_type.is_dir() {
            std::fs::create_dir_all(&target).map_err(copy_err)?;
        } else if !keep(entry.path()) {
            continue;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path()).map_err(copy_err)?;
            std::os::unix::fs::symlink(link, &target).map_err(copy_err)?;
        } else {
            std::fs::copy(entry.path(), &target).map_err(copy_err)?;
        }
    }
    Ok(())
}

/// Copy a directory keeping only files whose name matches one of `patterns`.
pub fn copy_dir_matching(src: &Path, dst: &Path, patterns: &[Regex]) -> Result<(), Error> {
    copy_dir_filtered(src, dst, |path| {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        patterns.iter().any(|p| p.is_match(&name))
    })
}

/// Copy a single file, creating the destination's parent directories.
pub fn copy_file(src: &Path, dst: &Path) -> Result<(), Error> {
    info!("Copying {} -> {}", src.display(), dst.display());
    let copy_err = |err| Error::Copy {
        src: src.to_path_buf(),
        dst: dst.to_path_buf(),
        err,
    };
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent).map_err(copy_err)?;
    }
    std::fs::copy(src, dst).map_err(copy_err)?;
    Ok(())
}

/// Write `<file>.sha256` in `sha256sum` format next to `file`.
pub fn create_sha(file: &Path) -> Result<(), Error> {
    let bytes = std::fs::read(file).map_err(io_err(file))?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let line = format!("{} {}\n", sha256::digest(bytes.as_slice()), name);
    let sha_file = sha_path(file);
    std::fs::write(&sha_file, line).map_err(io_err(&sha_file))
}

pub fn sha_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

/// Regular files under `dir`, recursively, sorted.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|err| Error::Walk(dir.to_path_buf(), err))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// File names directly inside `dir`, sorted.
pub fn read_dir_names(dir: &Path) -> Result<Vec<String>, Error> {
    let mut names = std::fs::read_dir(dir)
        .map_err(io_err(dir))?
        .map(|entry| {
            entry
                .map(|e| e.file_name().to_string_lossy().to_string())
                .map_err(io_err(dir))
        })
        .collect::<Result<Vec<_>, _>>()?;
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_dir_keeps_tree_and_links() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("a/b")).unwrap();
        std::fs::write(src.join("a/b/file.txt"), "hello").unwrap();
        std::os::unix::fs::symlink("b/file.txt", src.join("a/link")).unwrap();

        let dst = dir.path().join("dst");
        copy_dir(&src, &dst).unwrap();
        assert_eq!(std::fs::read_to_string(dst.join("a/b/file.txt")).unwrap(), "hello");
        assert_eq!(
            std::fs::read_link(dst.join("a/link")).unwrap(),
            Path::new("b/file.txt")
        );
    }

    #[test]
    fn copy_dir_matching_filters_files() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("samples");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("app.yaml"), "").unwrap();
        std::fs::write(src.join("sub/README.md"), "").unwrap();
        std::fs::write(src.join("sub/main.go"), "").unwrap();

        let dst = dir.path().join("out");
        let patterns = [Regex::new(r"\.yaml$").unwrap(), Regex::new(r"\.md$").unwrap()];
        copy_dir_matching(&src, &dst, &patterns).unwrap();
        assert!(dst.join("app.yaml").exists());
        assert!(dst.join("sub/README.md").exists());
        assert!(!dst.join("sub/main.go").exists());
    }

    #[test]
    fn sha_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("istio.tar.gz");
        std::fs::write(&file, "abc").unwrap();
        create_sha(&file).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("istio.tar.gz.sha256")).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad istio.tar.gz\n"
        );
    }
}
