use crate::{ArchiveFormat, EntryCompression};
use std::fmt::{Display, Formatter, Result as FmtResult};

impl Display for ArchiveFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.as_str())
    }
}

impl AsRef<str> for ArchiveFormat {
    fn as_ref(&self) -> &'static str {
        self.as_str()
    }
}

impl ArchiveFormat {
    /// Returns the file extension for this archive format, without the dot.
    #[inline]
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Cbz => "cbz",
            ArchiveFormat::Cbt => "cbt",
            #[cfg(feature = "rar")]
            ArchiveFormat::Cbr => "cbr",
        }
    }

    /// Returns the short name for configuration (for displaying to user)
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        self.extension()
    }

    /// Whether archives of this format can be written, not just read.
    #[inline]
    #[must_use]
    pub fn is_writable(&self) -> bool {
        match self {
            ArchiveFormat::Cbz | ArchiveFormat::Cbt => true,
            #[cfg(feature = "rar")]
            ArchiveFormat::Cbr => false,
        }
    }

    /// Verify that `bytes` start with the expected magic bytes for this format.
    ///
    /// Useful for cross-checking a format detected from a file extension
    /// against actual file contents.
    #[must_use]
    pub fn check_magic_bytes(&self, bytes: &[u8]) -> bool {
        Self::from_magic_bytes(bytes) == Some(*self)
    }
}

impl Display for EntryCompression {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.as_str())
    }
}

impl EntryCompression {
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryCompression::None => "none",
            EntryCompression::Deflate => "deflate",
            EntryCompression::Bzip2 => "bzip2",
            EntryCompression::Zstd => "zstd",
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{ArchiveFormat, EntryCompression};
    use rstest::rstest;

    #[rstest]
    #[case(ArchiveFormat::Cbz, "cbz")]
    #[case(ArchiveFormat::Cbt, "cbt")]
    #[cfg_attr(feature = "rar", case(ArchiveFormat::Cbr, "cbr"))]
    fn test_extension(#[case] format: ArchiveFormat, #[case] expected: &str) {
        assert_eq!(format.extension(), expected);
        assert_eq!(format.to_string(), expected);
        assert_eq!(expected.parse::<ArchiveFormat>().unwrap(), format);
    }

    #[rstest]
    #[case(EntryCompression::None)]
    #[case(EntryCompression::Deflate)]
    #[case(EntryCompression::Bzip2)]
    #[case(EntryCompression::Zstd)]
    fn test_entry_compression_display_parses(#[case] compression: EntryCompression) {
        assert_eq!(compression.to_string().parse::<EntryCompression>().unwrap(), compression);
    }

    #[test]
    fn test_check_magic_bytes() {
        assert!(ArchiveFormat::Cbz.check_magic_bytes(b"PK\x03\x04"));
        assert!(!ArchiveFormat::Cbt.check_magic_bytes(b"PK\x03\x04"));
    }
}
