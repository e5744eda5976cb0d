//! Output path generation.

use anyhow::{Context, Result};
use rand::RngCore;
use std::path::{Path, PathBuf};

/// Generate a collision-free output path inside `dir`.
///
/// 128 random bits plus an existence check keep names unique across
/// concurrent and historical runs in the same directory. The tool picks the
/// image format from the extension.
pub(crate) fn unique_output_path(dir: &Path, format: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create output directory {}", dir.display()))?;
    loop {
        let mut b = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut b);
        let path = dir.join(format!("upscaled_{:032x}.{format}", u128::from_le_bytes(b)));
        if !path.exists() {
            return Ok(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let mut b = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut b);
        std::env::temp_dir().join(format!("resup-test-{tag}-{:016x}", u64::from_le_bytes(b)))
    }

    #[test]
    fn sequential_paths_never_collide() {
        let dir = scratch_dir("outfile");
        let a = unique_output_path(&dir, "png").unwrap();
        std::fs::write(&a, b"partial").unwrap();
        let b = unique_output_path(&dir, "png").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.extension().unwrap(), "png");
        assert!(a.file_name().unwrap().to_str().unwrap().starts_with("upscaled_"));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn creates_missing_output_directory() {
        let dir = scratch_dir("outfile-mkdir").join("nested");
        let p = unique_output_path(&dir, "png").unwrap();
        assert!(dir.is_dir());
        assert_eq!(p.parent().unwrap(), dir);
        std::fs::remove_dir_all(dir.parent().unwrap()).unwrap();
    }
}
