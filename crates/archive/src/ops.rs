//! Archive Operations

use crate::construct::MAGIC_HEAD_LEN;
use crate::error::{ErrorKind, Result};
use crate::path::{normalize_separators, validate};
use crate::{ArchiveFormat, EntryCompression, Page};
use exn::ResultExt;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::field::Empty;
use tracing::instrument;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

// Entry sizes come from untrusted headers; never pre-allocate more than this.
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;
const TAR_BLOCK: u64 = 512;
const ENTRY_MODE: u32 = 0o644;

fn corrupt(reason: impl Into<String>) -> ErrorKind {
    ErrorKind::CorruptArchive(reason.into())
}

impl ArchiveFormat {
    /// Read every file entry of the archive at `path`, in container order.
    ///
    /// The extension must name a comic archive format; the content is then
    /// sniffed and may override it (see [`from_magic_bytes`](Self::from_magic_bytes)).
    /// Directory entries are skipped and every entry path is validated with
    /// [`validate_entry_path`](crate::validate_entry_path).
    ///
    /// # Errors
    /// - [`UnsupportedFormat`](ErrorKind::UnsupportedFormat) or
    ///   [`DisabledFormat`](ErrorKind::DisabledFormat) for the wrong extension,
    /// - [`CorruptArchive`](ErrorKind::CorruptArchive) when the container
    ///   cannot be parsed, holds an unsafe or duplicate entry path, or fails
    ///   its checksums,
    /// - [`Io`](ErrorKind::Io) when the file cannot be read at all.
    #[instrument(skip_all, fields(archive = %path.as_ref().display(), format = Empty, pages = Empty))]
    pub fn open(path: impl AsRef<Path>) -> Result<Vec<Page>> {
        let path = path.as_ref();
        let mut file = File::open(path).or_raise(|| ErrorKind::Io)?;
        let format = Self::resolve(path, &read_head(&mut file)?)?;
        tracing::Span::current().record("format", format.as_str());
        let pages = match format {
            ArchiveFormat::Cbz => read_zip(file)?,
            ArchiveFormat::Cbt => read_tar(file)?,
            #[cfg(feature = "rar")]
            ArchiveFormat::Cbr => read_rar(path)?,
        };
        let mut seen = HashSet::with_capacity(pages.len());
        for page in &pages {
            if !seen.insert(page.path.as_path()) {
                exn::bail!(corrupt(format!("duplicate entry: {}", page.path.display())));
            }
        }
        tracing::Span::current().record("pages", pages.len());
        Ok(pages)
    }

    /// Write `pages` as a new archive of this format at `destination`.
    ///
    /// The archive is assembled in a hidden `.partial` temporary file in the
    /// destination's directory and renamed into place once complete, so the
    /// destination name only ever refers to a finished archive. Output is
    /// deterministic: entries keep the given order, timestamps and
    /// permissions are fixed.
    ///
    /// A completed archive already at `destination` is never replaced
    /// ([`AlreadyExists`](ErrorKind::AlreadyExists)); anything else found
    /// there (a truncated file from another tool, say) is overwritten.
    #[instrument(skip(self, destination, pages), fields(format = %self, archive = %destination.as_ref().display(), pages = pages.len()))]
    pub fn write(&self, destination: impl AsRef<Path>, pages: &[Page], compression: EntryCompression) -> Result<()> {
        let destination = destination.as_ref();
        if !self.is_writable() {
            exn::bail!(ErrorKind::UnsupportedFormat(format!("{self} (read-only)")));
        }
        let entries = entry_names(pages)?;

        let replacing = destination.exists();
        if replacing {
            if Self::is_complete(destination) {
                exn::bail!(ErrorKind::AlreadyExists(destination.to_path_buf()));
            }
            tracing::warn!(archive = %destination.display(), "Replacing incomplete archive at destination");
        }

        let parent = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::Builder::new()
            .prefix(".")
            .suffix(".partial")
            .tempfile_in(parent)
            .or_raise(|| ErrorKind::Io)?;
        {
            let writer = BufWriter::new(tmp.as_file_mut());
            let writer = match self {
                ArchiveFormat::Cbz => write_zip(writer, &entries, compression)?,
                ArchiveFormat::Cbt => write_tar(writer, &entries)?,
                #[cfg(feature = "rar")]
                ArchiveFormat::Cbr => unreachable!("read-only formats are rejected above"),
            };
            writer.into_inner().map_err(|e| e.into_error()).or_raise(|| ErrorKind::Io)?;
        }
        tmp.as_file().sync_all().or_raise(|| ErrorKind::Io)?;

        // If anything above failed, dropping `tmp` removes the partial file.
        if replacing {
            tmp.persist(destination).or_raise(|| ErrorKind::Io)?;
        } else {
            match tmp.persist_noclobber(destination) {
                Ok(_) => {},
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                    exn::bail!(ErrorKind::AlreadyExists(destination.to_path_buf()))
                },
                Err(e) => return Err(e).or_raise(|| ErrorKind::Io),
            }
        }
        tracing::debug!("Archive written");
        Ok(())
    }

    /// Whether `path` holds a completed, readable archive.
    ///
    /// Only the container structure is checked (central directory, header
    /// chain, end-of-archive marker), not entry contents. Missing files, files
    /// with unknown extensions and truncated archives are all reported as
    /// incomplete.
    #[must_use]
    pub fn is_complete(path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let Ok(mut file) = File::open(path) else {
            return false;
        };
        let format = match read_head(&mut file).and_then(|head| Self::resolve(path, &head)) {
            Ok(format) => format,
            Err(_) => return false,
        };
        match format {
            ArchiveFormat::Cbz => ZipArchive::new(BufReader::new(file)).is_ok(),
            ArchiveFormat::Cbt => tar_is_complete(file),
            #[cfg(feature = "rar")]
            ArchiveFormat::Cbr => rar_is_complete(path),
        }
    }
}

/// Reads the leading bytes needed for format sniffing and rewinds.
fn read_head(file: &mut File) -> Result<Vec<u8>> {
    let mut head = Vec::with_capacity(MAGIC_HEAD_LEN);
    Read::by_ref(file).take(MAGIC_HEAD_LEN as u64).read_to_end(&mut head).or_raise(|| ErrorKind::Io)?;
    file.seek(SeekFrom::Start(0)).or_raise(|| ErrorKind::Io)?;
    Ok(head)
}

fn read_zip(file: File) -> Result<Vec<Page>> {
    let mut archive = ZipArchive::new(BufReader::new(file)).or_raise(|| corrupt("unreadable ZIP central directory"))?;
    let mut pages = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).or_raise(|| corrupt(format!("unreadable ZIP entry #{index}")))?;
        if entry.is_dir() {
            continue;
        }
        let path = validate(normalize_separators(entry.name()))?;
        let mut data = Vec::with_capacity(usize::try_from(entry.size().min(MAX_PREALLOCATION)).unwrap_or(0));
        // CRC32 is verified by the entry reader once it reaches the end.
        entry.read_to_end(&mut data).or_raise(|| corrupt(format!("unreadable ZIP entry: {}", path.display())))?;
        pages.push(Page { path, data });
    }
    Ok(pages)
}

fn read_tar(file: File) -> Result<Vec<Page>> {
    if file.metadata().or_raise(|| ErrorKind::Io)?.len() == 0 {
        exn::bail!(corrupt("empty TAR file"));
    }
    let mut archive = tar::Archive::new(BufReader::new(file));
    let mut pages = Vec::new();
    for entry in archive.entries().or_raise(|| corrupt("unreadable TAR header"))? {
        let mut entry = entry.or_raise(|| corrupt("unreadable TAR entry"))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let raw: PathBuf = entry.path().or_raise(|| corrupt("unreadable TAR entry name"))?.into_owned();
        let path = validate(raw)?;
        let mut data = Vec::with_capacity(usize::try_from(entry.size().min(MAX_PREALLOCATION)).unwrap_or(0));
        entry.read_to_end(&mut data).or_raise(|| corrupt(format!("unreadable TAR entry: {}", path.display())))?;
        pages.push(Page { path, data });
    }
    Ok(pages)
}

#[cfg(feature = "rar")]
fn read_rar(path: &Path) -> Result<Vec<Page>> {
    let mut archive =
        unrar::Archive::new(path).open_for_processing().or_raise(|| corrupt("unreadable RAR archive"))?;
    let mut pages = Vec::new();
    while let Some(header) = archive.read_header().or_raise(|| corrupt("unreadable RAR header"))? {
        archive = if header.entry().is_file() {
            let path = validate(&header.entry().filename)?;
            let (data, rest) =
                header.read().or_raise(|| corrupt(format!("unreadable RAR entry: {}", path.display())))?;
            pages.push(Page { path, data });
            rest
        } else {
            header.skip().or_raise(|| corrupt("unreadable RAR entry"))?
        };
    }
    Ok(pages)
}

fn tar_is_complete(file: File) -> bool {
    let Ok(len) = file.metadata().map(|m| m.len()) else {
        return false;
    };
    // A finished TAR stream is block-aligned and ends with two zero blocks.
    if len < 2 * TAR_BLOCK || len % TAR_BLOCK != 0 {
        return false;
    }
    let mut archive = tar::Archive::new(BufReader::new(file));
    match archive.entries() {
        Ok(mut entries) => entries.all(|entry| entry.is_ok()),
        Err(_) => false,
    }
}

#[cfg(feature = "rar")]
fn rar_is_complete(path: &Path) -> bool {
    match unrar::Archive::new(path).open_for_listing() {
        Ok(mut listing) => listing.all(|entry| entry.is_ok()),
        Err(_) => false,
    }
}

/// Validates page paths for writing and renders them as `/`-separated entry
/// names, rejecting duplicates.
fn entry_names(pages: &[Page]) -> Result<Vec<(String, &[u8])>> {
    let mut seen = HashSet::with_capacity(pages.len());
    let mut entries = Vec::with_capacity(pages.len());
    for page in pages {
        let path = validate(&page.path)?;
        let name = path.components().map(|c| c.as_os_str().to_string_lossy()).collect::<Vec<_>>().join("/");
        if !seen.insert(name.clone()) {
            exn::bail!(corrupt(format!("duplicate entry: {name}")));
        }
        entries.push((name, page.data.as_slice()));
    }
    Ok(entries)
}

fn entry_options(compression: EntryCompression) -> SimpleFileOptions {
    // Use the highest compression level available for each method; pages are
    // written once and read many times.
    let options = SimpleFileOptions::default()
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(ENTRY_MODE);
    match compression {
        EntryCompression::None => options.compression_method(CompressionMethod::Stored),
        EntryCompression::Deflate => options.compression_method(CompressionMethod::Deflated).compression_level(Some(9)),
        EntryCompression::Bzip2 => options.compression_method(CompressionMethod::Bzip2).compression_level(Some(9)),
        EntryCompression::Zstd => options.compression_method(CompressionMethod::Zstd).compression_level(Some(22)),
    }
}

fn write_zip<W: Write + Seek>(writer: W, entries: &[(String, &[u8])], compression: EntryCompression) -> Result<W> {
    let mut zip = ZipWriter::new(writer);
    for (name, data) in entries {
        zip.start_file(name.as_str(), entry_options(compression)).or_raise(|| ErrorKind::Io)?;
        zip.write_all(data).or_raise(|| ErrorKind::Io)?;
    }
    zip.finish().or_raise(|| ErrorKind::Io)
}

fn write_tar<W: Write>(writer: W, entries: &[(String, &[u8])]) -> Result<W> {
    let mut builder = tar::Builder::new(writer);
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(ENTRY_MODE);
        header.set_mtime(0);
        builder.append_data(&mut header, name, *data).or_raise(|| ErrorKind::Io)?;
    }
    builder.into_inner().or_raise(|| ErrorKind::Io)
}
