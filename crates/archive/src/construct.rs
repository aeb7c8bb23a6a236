use crate::error::{Error, ErrorKind, Result};
use crate::{ArchiveFormat, EntryCompression};
use std::{path::Path, str::FromStr};

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
// An archive with no entries is just an end-of-central-directory record.
const ZIP_EMPTY_MAGIC: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];
const TAR_MAGIC: &[u8] = b"ustar";
const TAR_MAGIC_OFFSET: usize = 257;
#[cfg(feature = "rar")]
const RAR_MAGIC: [u8; 6] = [0x52, 0x61, 0x72, 0x21, 0x1A, 0x07];

/// Number of leading bytes needed by [`ArchiveFormat::from_magic_bytes`] to
/// detect every format.
pub(crate) const MAGIC_HEAD_LEN: usize = TAR_MAGIC_OFFSET + TAR_MAGIC.len();

impl FromStr for ArchiveFormat {
    type Err = Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cbz" | "zip" => Ok(ArchiveFormat::Cbz),
            "cbt" | "tar" => Ok(ArchiveFormat::Cbt),
            #[cfg(feature = "rar")]
            "cbr" | "rar" => Ok(ArchiveFormat::Cbr),
            #[cfg(not(feature = "rar"))]
            "cbr" | "rar" => exn::bail!(ErrorKind::DisabledFormat(s.to_string())),
            _ => exn::bail!(ErrorKind::UnsupportedFormat(s.to_string())),
        }
    }
}

impl FromStr for EntryCompression {
    type Err = Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "store" | "stored" => Ok(EntryCompression::None),
            "deflate" | "deflated" => Ok(EntryCompression::Deflate),
            "bz2" | "bzip2" => Ok(EntryCompression::Bzip2),
            "zst" | "zstd" => Ok(EntryCompression::Zstd),
            _ => exn::bail!(ErrorKind::UnsupportedFormat(s.to_string())),
        }
    }
}

impl ArchiveFormat {
    /// Detect the archive format from a file extension.
    ///
    /// Only the comic extensions (`.cbz`, `.cbt`, `.cbr`) are recognised;
    /// anything else is [`UnsupportedFormat`](ErrorKind::UnsupportedFormat).
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
            exn::bail!(ErrorKind::UnsupportedFormat(path.display().to_string()));
        };
        match ext.to_lowercase().as_str() {
            "cbz" => Ok(ArchiveFormat::Cbz),
            "cbt" => Ok(ArchiveFormat::Cbt),
            #[cfg(feature = "rar")]
            "cbr" => Ok(ArchiveFormat::Cbr),
            #[cfg(not(feature = "rar"))]
            "cbr" => exn::bail!(ErrorKind::DisabledFormat(ext.to_string())),
            _ => exn::bail!(ErrorKind::UnsupportedFormat(ext.to_string())),
        }
    }

    /// Detect the archive format from magic bytes.
    ///
    /// Returns `None` if no enabled format matches or if the input is too
    /// short to detect any format.
    #[must_use]
    pub fn from_magic_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&ZIP_MAGIC) || bytes.starts_with(&ZIP_EMPTY_MAGIC) {
            return Some(ArchiveFormat::Cbz);
        }
        #[cfg(feature = "rar")]
        if bytes.starts_with(&RAR_MAGIC) {
            return Some(ArchiveFormat::Cbr);
        }
        if bytes.get(TAR_MAGIC_OFFSET..MAGIC_HEAD_LEN) == Some(TAR_MAGIC) {
            return Some(ArchiveFormat::Cbt);
        }
        None
    }

    /// Pick the format for an on-disk archive given its leading bytes.
    ///
    /// The extension must be a known comic extension. When the content is
    /// recognisably a different enabled container (comic tools love naming
    /// ZIP files `.cbr`), the content wins.
    pub(crate) fn resolve(path: &Path, head: &[u8]) -> Result<Self> {
        let claimed = Self::from_path(path);
        match (claimed, Self::from_magic_bytes(head)) {
            (Ok(claimed), Some(detected)) if claimed != detected => {
                tracing::warn!(
                    archive = %path.display(),
                    extension = %claimed,
                    detected = %detected,
                    "Archive content does not match its extension; using detected format"
                );
                Ok(detected)
            },
            (Ok(claimed), _) => Ok(claimed),
            (Err(e), Some(detected)) if matches!(&*e, ErrorKind::DisabledFormat(_)) => {
                tracing::warn!(
                    archive = %path.display(),
                    detected = %detected,
                    "Archive extension names a disabled format; using detected format"
                );
                Ok(detected)
            },
            (Err(e), _) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ErrorKind;
    use crate::{ArchiveFormat, EntryCompression};
    use rstest::rstest;
    use std::path::Path;

    #[rstest]
    #[case("cbz", ArchiveFormat::Cbz)]
    #[case("ZIP", ArchiveFormat::Cbz)]
    #[case("cbt", ArchiveFormat::Cbt)]
    #[case("tar", ArchiveFormat::Cbt)]
    #[cfg_attr(feature = "rar", case("cbr", ArchiveFormat::Cbr))]
    fn test_from_str(#[case] test: &str, #[case] expected: ArchiveFormat) {
        assert_eq!(test.parse::<ArchiveFormat>().unwrap(), expected);
    }

    #[rstest]
    #[case("cb7")]
    #[case("pdf")]
    #[case(" ")]
    fn test_from_str_invalid(#[case] test: &str) {
        assert!(test.parse::<ArchiveFormat>().is_err());
    }

    #[rstest]
    #[case("none", EntryCompression::None)]
    #[case("stored", EntryCompression::None)]
    #[case("deflate", EntryCompression::Deflate)]
    #[case("BZIP2", EntryCompression::Bzip2)]
    #[case("zst", EntryCompression::Zstd)]
    fn test_entry_compression_from_str(#[case] test: &str, #[case] expected: EntryCompression) {
        assert_eq!(test.parse::<EntryCompression>().unwrap(), expected);
    }

    #[rstest]
    #[case("Book 01.cbz", ArchiveFormat::Cbz)]
    #[case("dir/Book 01.CBZ", ArchiveFormat::Cbz)]
    #[case("Book 01.cbt", ArchiveFormat::Cbt)]
    #[cfg_attr(feature = "rar", case("Book 01.cbr", ArchiveFormat::Cbr))]
    fn test_from_path(#[case] test: &str, #[case] expected: ArchiveFormat) {
        assert_eq!(ArchiveFormat::from_path(test).unwrap(), expected);
    }

    #[rstest]
    #[case("Book 01.zip")]
    #[case("Book 01.cb7")]
    #[case("Book 01")]
    // A dotfile has no extension at all.
    #[case(".cbz")]
    fn test_from_path_unsupported(#[case] test: &str) {
        let err = ArchiveFormat::from_path(test).unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnsupportedFormat(_)));
    }

    #[cfg(not(feature = "rar"))]
    #[test]
    fn test_from_path_disabled() {
        let err = ArchiveFormat::from_path("Book 01.cbr").unwrap_err();
        assert!(matches!(&*err, ErrorKind::DisabledFormat(_)));
    }

    #[test]
    fn test_from_magic_bytes() {
        assert_eq!(ArchiveFormat::from_magic_bytes(b"PK\x03\x04rest"), Some(ArchiveFormat::Cbz));
        assert_eq!(ArchiveFormat::from_magic_bytes(b"PK\x05\x06"), Some(ArchiveFormat::Cbz));
        assert_eq!(ArchiveFormat::from_magic_bytes(b""), None);
        assert_eq!(ArchiveFormat::from_magic_bytes(b"<!DOCTYPE html>"), None);
        let mut tar_head = vec![0u8; 512];
        tar_head[257..262].copy_from_slice(b"ustar");
        assert_eq!(ArchiveFormat::from_magic_bytes(&tar_head), Some(ArchiveFormat::Cbt));
    }

    #[test]
    fn test_resolve_prefers_content() {
        let resolved = ArchiveFormat::resolve(Path::new("Book.cbt"), b"PK\x03\x04").unwrap();
        assert_eq!(resolved, ArchiveFormat::Cbz);
        let resolved = ArchiveFormat::resolve(Path::new("Book.cbz"), b"garbage").unwrap();
        assert_eq!(resolved, ArchiveFormat::Cbz);
        // A misnamed ZIP is still readable when RAR support is compiled out.
        let resolved = ArchiveFormat::resolve(Path::new("Book.cbr"), b"PK\x03\x04").unwrap();
        assert_eq!(resolved, ArchiveFormat::Cbz);
        assert!(ArchiveFormat::resolve(Path::new("Book.pdf"), b"PK\x03\x04").is_err());
    }
}
