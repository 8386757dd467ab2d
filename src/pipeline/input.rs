//! Input validation: turn user-supplied paths into [`ImageDescriptor`]s.
//!
//! Every check happens up front, before any batch is planned or any request
//! is sent. A job either starts with a fully validated, ordered image list or
//! fails immediately with a validation error naming the offending path.

use crate::config::ValidationLimits;
use crate::error::Img2MdError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Extensions accepted by the validator (lower-case).
pub const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "gif"];

/// A validated input image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub path: PathBuf,
    pub filename: String,
    pub byte_size: u64,
    /// 0-indexed position in the job's input list; the only ordering key
    /// used when pages are reassembled.
    pub page_index: usize,
}

impl ImageDescriptor {
    /// 1-indexed page number this image will produce.
    pub fn page_number(&self) -> usize {
        self.page_index + 1
    }
}

/// Lower-cased extension of `path`, if any.
fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// True when the path has a supported image extension.
pub fn is_supported_image(path: &Path) -> bool {
    extension_of(path).is_some_and(|e| SUPPORTED_EXTENSIONS.contains(&e.as_str()))
}

/// MIME type for a supported image path. Unknown extensions map to
/// `application/octet-stream`.
pub fn mime_type_for(path: &Path) -> &'static str {
    match extension_of(path).as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}

/// Validate an ordered list of image paths.
///
/// Descriptors are returned in input order with `page_index` equal to their
/// position. The first failing path aborts validation.
pub fn validate_images(
    paths: &[PathBuf],
    limits: &ValidationLimits,
) -> Result<Vec<ImageDescriptor>, Img2MdError> {
    if paths.is_empty() {
        return Err(Img2MdError::NoImages);
    }
    if paths.len() > limits.max_images {
        return Err(Img2MdError::TooManyImages {
            count: paths.len(),
            max: limits.max_images,
        });
    }

    paths
        .iter()
        .enumerate()
        .map(|(page_index, path)| validate_one(path, page_index, limits))
        .collect()
}

fn validate_one(
    path: &Path,
    page_index: usize,
    limits: &ValidationLimits,
) -> Result<ImageDescriptor, Img2MdError> {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(Img2MdError::PermissionDenied {
                path: path.to_path_buf(),
            })
        }
        Err(_) => {
            return Err(Img2MdError::FileNotFound {
                path: path.to_path_buf(),
            })
        }
    };

    if !meta.is_file() {
        return Err(Img2MdError::NotAFile {
            path: path.to_path_buf(),
        });
    }

    if meta.len() > limits.max_file_size {
        return Err(Img2MdError::FileTooLarge {
            path: path.to_path_buf(),
            size: meta.len(),
            max: limits.max_file_size,
        });
    }

    if !is_supported_image(path) {
        return Err(Img2MdError::UnsupportedFormat {
            path: path.to_path_buf(),
            extension: extension_of(path).unwrap_or_default(),
        });
    }

    // Check read permission by attempting to open
    if let Err(e) = std::fs::File::open(path) {
        return Err(if e.kind() == std::io::ErrorKind::PermissionDenied {
            Img2MdError::PermissionDenied {
                path: path.to_path_buf(),
            }
        } else {
            Img2MdError::FileNotFound {
                path: path.to_path_buf(),
            }
        });
    }

    let filename = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();

    debug!("Validated image #{}: {} ({} bytes)", page_index + 1, filename, meta.len());
    Ok(ImageDescriptor {
        path: path.to_path_buf(),
        filename,
        byte_size: meta.len(),
        page_index,
    })
}

/// Expand CLI-style inputs into an ordered image list.
///
/// Files are kept in argument order. Each directory contributes its
/// supported images (non-recursive), naturally sorted by file name so that
/// `page2.png` comes before `page10.png`.
pub fn collect_images(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, Img2MdError> {
    let mut out = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let entries = std::fs::read_dir(input).map_err(|e| {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    Img2MdError::PermissionDenied { path: input.clone() }
                } else {
                    Img2MdError::FileNotFound { path: input.clone() }
                }
            })?;
            let mut files: Vec<PathBuf> = entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_supported_image(p))
                .collect();
            files.sort_by(|a, b| natural_cmp(&file_key(a), &file_key(b)));
            debug!("{}: {} image(s)", input.display(), files.len());
            out.extend(files);
        } else {
            out.push(input.clone());
        }
    }
    Ok(out)
}

fn file_key(path: &Path) -> String {
    path.file_name()
        .map(|f| f.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Compare strings treating runs of ASCII digits as numbers.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a = a.chars().peekable();
    let mut b = b.chars().peekable();

    loop {
        match (a.peek().copied(), b.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let na = take_number(&mut a);
                let nb = take_number(&mut b);
                // Compare by magnitude first (length after stripping zeros), then digits.
                let ta = na.trim_start_matches('0');
                let tb = nb.trim_start_matches('0');
                let ord = ta.len().cmp(&tb.len()).then_with(|| ta.cmp(tb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                a.next();
                b.next();
            }
        }
    }
}

fn take_number(it: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut s = String::new();
    while let Some(c) = it.peek().copied().filter(char::is_ascii_digit) {
        s.push(c);
        it.next();
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, bytes: usize) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, vec![0u8; bytes]).unwrap();
        p
    }

    #[test]
    fn validates_in_order_with_page_indices() {
        let tmp = tempfile::tempdir().unwrap();
        let a = write(tmp.path(), "b.png", 10);
        let b = write(tmp.path(), "a.JPG", 20);
        let out = validate_images(&[a, b], &ValidationLimits::default()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].filename, "b.png");
        assert_eq!(out[0].page_index, 0);
        assert_eq!(out[1].byte_size, 20);
        assert_eq!(out[1].page_number(), 2);
    }

    #[test]
    fn rejects_empty_and_too_many() {
        let limits = ValidationLimits {
            max_images: 1,
            ..Default::default()
        };
        assert!(matches!(
            validate_images(&[], &limits),
            Err(Img2MdError::NoImages)
        ));
        let paths = vec![PathBuf::from("a.png"), PathBuf::from("b.png")];
        assert!(matches!(
            validate_images(&paths, &limits),
            Err(Img2MdError::TooManyImages { count: 2, max: 1 })
        ));
    }

    #[test]
    fn rejects_missing_directory_large_and_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        let limits = ValidationLimits {
            max_images: 10,
            max_file_size: 100,
        };

        let missing = tmp.path().join("nope.png");
        assert!(matches!(
            validate_images(&[missing], &limits),
            Err(Img2MdError::FileNotFound { .. })
        ));

        let dir = tmp.path().join("dir.png");
        std::fs::create_dir(&dir).unwrap();
        assert!(matches!(
            validate_images(&[dir], &limits),
            Err(Img2MdError::NotAFile { .. })
        ));

        let big = write(tmp.path(), "big.png", 101);
        assert!(matches!(
            validate_images(&[big], &limits),
            Err(Img2MdError::FileTooLarge { size: 101, max: 100, .. })
        ));

        let tiff = write(tmp.path(), "scan.tiff", 5);
        match validate_images(&[tiff], &limits) {
            Err(Img2MdError::UnsupportedFormat { extension, .. }) => assert_eq!(extension, "tiff"),
            other => panic!("expected UnsupportedFormat, got {other:?}"),
        }
    }

    #[test]
    fn mime_types() {
        assert_eq!(mime_type_for(Path::new("x.PNG")), "image/png");
        assert_eq!(mime_type_for(Path::new("x.jpeg")), "image/jpeg");
        assert_eq!(mime_type_for(Path::new("x.webp")), "image/webp");
        assert_eq!(mime_type_for(Path::new("x")), "application/octet-stream");
    }

    #[test]
    fn natural_ordering() {
        let mut names = vec!["page10.png", "page2.png", "page1.png", "page02b.png"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["page1.png", "page2.png", "page02b.png", "page10.png"]);
    }

    #[test]
    fn collect_images_expands_directories_naturally() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("scans");
        std::fs::create_dir(&dir).unwrap();
        write(&dir, "p10.png", 1);
        write(&dir, "p2.png", 1);
        write(&dir, "notes.txt", 1);
        let single = write(tmp.path(), "cover.jpg", 1);

        let out = collect_images(&[single.clone(), dir.clone()]).unwrap();
        assert_eq!(out, vec![single, dir.join("p2.png"), dir.join("p10.png")]);
    }
}
