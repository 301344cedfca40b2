use anyhow::{ensure, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Create one of the build's sibling directories (`<gol>-work`,
/// `<gol>-indexes`). A directory left behind by an earlier or aborted
/// build is reused; anything else in the way is an error.
pub fn create_build_dir(path: &Path, role: &str) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    ensure!(
        !path.exists(),
        "Cannot use {} as the {role}: a file is in the way",
        path.display()
    );
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create {role} {}", path.display()))
}

/// Append `ext` if the path has no extension at all.
pub fn with_default_extension(path: &Path, ext: &str) -> PathBuf {
    if path.extension().is_some() {
        path.to_path_buf()
    } else {
        let mut p = path.as_os_str().to_os_string();
        p.push(".");
        p.push(ext);
        PathBuf::from(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_extension_applies_only_when_missing() {
        assert_eq!(
            with_default_extension(Path::new("planet"), "gol"),
            PathBuf::from("planet.gol")
        );
        assert_eq!(
            with_default_extension(Path::new("planet.osm.pbf"), "gol"),
            PathBuf::from("planet.osm.pbf")
        );
    }

    #[test]
    fn build_dirs_are_created_and_reused_but_never_files() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("planet-work");
        create_build_dir(&work, "work directory").unwrap();
        assert!(work.is_dir());
        // a leftover directory from an aborted build is fine
        create_build_dir(&work, "work directory").unwrap();
        // a file squatting on the name is not
        let blocked = dir.path().join("planet-indexes");
        std::fs::write(&blocked, b"not a directory").unwrap();
        assert!(create_build_dir(&blocked, "index directory").is_err());
    }
}
