//! File classification and size-checked reads for workflow inputs.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Hard ceiling for a single input file. Reads beyond this fail the step.
pub const MAX_INPUT_FILE_BYTES: u64 = 10 * 1024 * 1024;

const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "yml", "yaml", "html", "json", "csv", "xml"];

const SOURCE_EXTENSIONS: &[&str] = &[
    "go", "py", "js", "ts", "java", "c", "cpp", "h", "hpp", "rs", "rb", "php", "swift", "kt",
    "scala", "cs", "sh", "pl", "r", "sql",
];

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp"];

const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "doc", "docx"];

/// How the input resolver should treat a path, decided by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileClass {
    Text,
    SourceCode,
    Image,
    Document,
    Unknown,
}

pub fn classify(path: &Path) -> FileClass {
    let ext = match path.extension().and_then(|e| e.to_str()) {
        Some(e) => e.to_ascii_lowercase(),
        None => return FileClass::Unknown,
    };
    if TEXT_EXTENSIONS.contains(&ext.as_str()) {
        FileClass::Text
    } else if SOURCE_EXTENSIONS.contains(&ext.as_str()) {
        FileClass::SourceCode
    } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        FileClass::Image
    } else if DOCUMENT_EXTENSIONS.contains(&ext.as_str()) {
        FileClass::Document
    } else {
        FileClass::Unknown
    }
}

/// MIME type inferred from the file extension.
pub fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("txt") => "text/plain",
        Some("md") => "text/markdown",
        Some("yml") | Some("yaml") => "application/yaml",
        Some("html") => "text/html",
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        Some("xml") => "application/xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("pdf") => "application/pdf",
        Some("doc") => "application/msword",
        Some("docx") => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        _ => "text/plain",
    }
}

/// Reads a file, rejecting anything over [`MAX_INPUT_FILE_BYTES`].
pub fn read_checked(path: &Path) -> io::Result<Vec<u8>> {
    let meta = fs::metadata(path)?;
    if meta.len() > MAX_INPUT_FILE_BYTES {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!(
                "file '{}' is {} bytes, over the {} byte limit",
                path.display(),
                meta.len(),
                MAX_INPUT_FILE_BYTES
            ),
        ));
    }
    fs::read(path)
}

/// Collects every regular file under a directory, depth-first.
pub fn collect_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(io::Error::other)?;
        if entry.path().is_file() {
            files.push(entry.path().to_path_buf());
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_extension() {
        assert_eq!(classify(Path::new("notes.md")), FileClass::Text);
        assert_eq!(classify(Path::new("main.rs")), FileClass::SourceCode);
        assert_eq!(classify(Path::new("photo.JPG")), FileClass::Image);
        assert_eq!(classify(Path::new("paper.pdf")), FileClass::Document);
        assert_eq!(classify(Path::new("archive.tar")), FileClass::Unknown);
        assert_eq!(classify(Path::new("Makefile")), FileClass::Unknown);
    }

    #[test]
    fn mime_follows_extension() {
        assert_eq!(mime_for(Path::new("a.json")), "application/json");
        assert_eq!(mime_for(Path::new("a.jpeg")), "image/jpeg");
        assert_eq!(mime_for(Path::new("a.pdf")), "application/pdf");
        assert_eq!(mime_for(Path::new("a.unknown")), "text/plain");
    }

    #[test]
    fn read_checked_reads_small_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.txt");
        std::fs::write(&path, b"ok").unwrap();
        assert_eq!(read_checked(&path).unwrap(), b"ok");
        assert!(read_checked(&dir.path().join("absent.txt")).is_err());
    }
}
