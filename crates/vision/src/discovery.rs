use imgshard_common::{ImgShardError, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Image file extensions picked up by a dataset scan (matched case-insensitively)
pub const SUPPORTED_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "bmp", "png"];

/// Whether `path` has a supported image extension
pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
        .unwrap_or(false)
}

/// Store identity of an image: its file name
pub fn identity_from_path(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            ImgShardError::invalid_input(format!(
                "cannot derive an identity from {}",
                path.display()
            ))
        })
}

/// Recursively collect every supported image under `root`, sorted by path
pub async fn scan_images(root: &Path) -> Result<Vec<PathBuf>> {
    let meta = fs::metadata(root).await.map_err(|e| {
        ImgShardError::invalid_input(format!("cannot read dataset {}: {}", root.display(), e))
    })?;
    if !meta.is_dir() {
        return Err(ImgShardError::invalid_input(format!(
            "dataset root {} is not a directory",
            root.display()
        )));
    }

    let mut images = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(path);
            } else if is_supported_image(&path) {
                images.push(path);
            }
        }
    }

    images.sort();
    debug!("Found {} images under {}", images.len(), root.display());
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_extensions() {
        assert!(is_supported_image(Path::new("a/cat.jpg")));
        assert!(is_supported_image(Path::new("a/cat.JPEG")));
        assert!(is_supported_image(Path::new("cat.Png")));
        assert!(!is_supported_image(Path::new("cat.gif")));
        assert!(!is_supported_image(Path::new("jpg")));
    }

    #[test]
    fn test_identity_from_path() {
        assert_eq!(identity_from_path(Path::new("/data/pets/cat.jpg")).unwrap(), "cat.jpg");
        assert!(identity_from_path(Path::new("/")).is_err());
    }

    #[tokio::test]
    async fn test_scan_images_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("pets").join("cats");
        std::fs::create_dir_all(&nested).unwrap();
        for file in ["b.png", "notes.txt"] {
            std::fs::write(dir.path().join(file), b"").unwrap();
        }
        for file in ["a.JPG", "c.bmp"] {
            std::fs::write(nested.join(file), b"").unwrap();
        }

        let images = scan_images(dir.path()).await.unwrap();

        let names: Vec<_> = images
            .iter()
            .map(|p| identity_from_path(p).unwrap())
            .collect();
        assert_eq!(names, ["b.png", "a.JPG", "c.bmp"]);
    }

    #[tokio::test]
    async fn test_scan_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_images(&dir.path().join("nope")).await.is_err());
    }
}
