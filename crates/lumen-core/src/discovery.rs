//! Finding image files to upload from paths given on the command line.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::ProcessingConfig;
use crate::types::ImageFormat;

/// A candidate upload found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub path: PathBuf,
    pub size: u64,
    /// Format implied by the extension; the bytes are checked at upload
    pub format_hint: Option<ImageFormat>,
}

impl InputFile {
    /// Mime type to declare on upload.
    pub fn declared_mime(&self) -> &'static str {
        self.format_hint
            .map(|f| f.mime_type())
            .unwrap_or("application/octet-stream")
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Expands files and directories into a sorted, de-duplicated list of images.
pub struct InputDiscovery {
    extensions: Vec<String>,
}

impl InputDiscovery {
    pub fn new(config: &ProcessingConfig) -> Self {
        Self {
            extensions: config
                .supported_formats
                .iter()
                .map(|ext| ext.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Files are taken as given if supported; directories are walked recursively.
    pub fn discover(&self, paths: &[PathBuf]) -> Vec<InputFile> {
        let mut seen = BTreeSet::new();
        let mut files = Vec::new();
        for root in paths {
            if root.is_file() {
                self.push(root, &mut seen, &mut files);
                continue;
            }
            for entry in WalkDir::new(root)
                .follow_links(true)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                self.push(entry.path(), &mut seen, &mut files);
            }
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }

    fn push(&self, path: &Path, seen: &mut BTreeSet<PathBuf>, files: &mut Vec<InputFile>) {
        if !self.is_supported(path) || !seen.insert(path.to_path_buf()) {
            return;
        }
        match std::fs::metadata(path) {
            Ok(meta) => files.push(InputFile {
                path: path.to_path_buf(),
                size: meta.len(),
                format_hint: format_from_extension(path),
            }),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Cannot stat input"),
        }
    }

    fn is_supported(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.iter().any(|s| s.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }
}

fn format_from_extension(path: &Path) -> Option<ImageFormat> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
        "png" => Some(ImageFormat::Png),
        "gif" => Some(ImageFormat::Gif),
        "webp" => Some(ImageFormat::Webp),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovers_supported_files_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("b.PNG"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("nested/a.jpeg"), b"xyz").unwrap();

        let discovery = InputDiscovery::new(&ProcessingConfig::default());
        let files = discovery.discover(&[dir.path().to_path_buf()]);

        let names: Vec<_> = files.iter().map(InputFile::file_name).collect();
        assert_eq!(names, vec!["b.PNG", "a.jpeg"]);
        assert_eq!(files[1].size, 3);
        assert_eq!(files[1].declared_mime(), "image/jpeg");
        assert_eq!(files[0].format_hint, Some(ImageFormat::Png));
    }

    #[test]
    fn test_explicit_files_are_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let photo = dir.path().join("photo.webp");
        std::fs::write(&photo, b"x").unwrap();

        let discovery = InputDiscovery::new(&ProcessingConfig::default());
        let files = discovery.discover(&[photo.clone(), dir.path().to_path_buf()]);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, photo);
    }

    #[test]
    fn test_extension_filter_follows_config() {
        let config = ProcessingConfig {
            supported_formats: vec!["png".into()],
            ..ProcessingConfig::default()
        };
        let discovery = InputDiscovery::new(&config);
        assert!(discovery.is_supported(Path::new("a.png")));
        assert!(!discovery.is_supported(Path::new("a.jpg")));
        assert!(!discovery.is_supported(Path::new("README")));
    }
}
