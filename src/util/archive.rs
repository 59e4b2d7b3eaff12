//! Compressed tar archives of directory trees.
//!
//! Creating an archive is split into [collect], which walks a directory and
//! describes every [Entry], and [write_entries], which streams those entries
//! into a tar stream. [extract_archive] is the inverse and refuses entries that
//! would end up outside of the destination directory.

use std::fs::{self, File, Permissions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use clap::ValueEnum;
use derive_more::{Display, Error};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Archive, Builder, EntryType, Header};
use walkdir::WalkDir;
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

const XZ_PRESET: u32 = 6;

/// Compression applied to the tar stream.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    ValueEnum,
    Display,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    #[display("gzip")]
    Gzip,
    #[display("bzip2")]
    Bzip2,
    #[display("xz")]
    Xz,
    /// Plain, uncompressed tar.
    #[display("none")]
    None,
}

impl Compression {
    pub const ALL: [Compression; 4] = [Self::Gzip, Self::Bzip2, Self::Xz, Self::None];

    /// File extension of archives using this compression.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Gzip => "tar.gz",
            Self::Bzip2 => "tar.bz2",
            Self::Xz => "tar.xz",
            Self::None => "tar",
        }
    }

    /// Detects the compression of an archive by its magic bytes.
    pub fn detect(path: &Path) -> io::Result<Self> {
        let mut magic = Vec::with_capacity(6);
        File::open(path)?.take(6).read_to_end(&mut magic)?;

        let compression = if magic.starts_with(&[0x1f, 0x8b]) {
            Self::Gzip
        } else if magic.starts_with(b"BZh") {
            Self::Bzip2
        } else if magic.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            Self::Xz
        } else {
            Self::None
        };
        Ok(compression)
    }

    fn encoder<W: Write>(self, inner: W) -> Encoder<W> {
        match self {
            Self::Gzip => Encoder::Gzip(GzEncoder::new(inner, flate2::Compression::default())),
            Self::Bzip2 => Encoder::Bzip2(BzEncoder::new(inner, bzip2::Compression::default())),
            Self::Xz => Encoder::Xz(XzEncoder::new(inner, XZ_PRESET)),
            Self::None => Encoder::Plain(inner),
        }
    }

    fn decoder<'a, R: Read + 'a>(self, inner: R) -> Box<dyn Read + 'a> {
        match self {
            Self::Gzip => Box::new(GzDecoder::new(inner)),
            Self::Bzip2 => Box::new(BzDecoder::new(inner)),
            Self::Xz => Box::new(XzDecoder::new(inner)),
            Self::None => Box::new(inner),
        }
    }
}

enum Encoder<W: Write> {
    Gzip(GzEncoder<W>),
    Bzip2(BzEncoder<W>),
    Xz(XzEncoder<W>),
    Plain(W),
}

impl<W: Write> Encoder<W> {
    /// Writes the trailer of the compression format and returns the inner writer.
    fn finish(self) -> io::Result<W> {
        match self {
            Self::Gzip(encoder) => encoder.finish(),
            Self::Bzip2(encoder) => encoder.finish(),
            Self::Xz(encoder) => encoder.finish(),
            Self::Plain(inner) => Ok(inner),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Gzip(encoder) => encoder.write(buf),
            Self::Bzip2(encoder) => encoder.write(buf),
            Self::Xz(encoder) => encoder.write(buf),
            Self::Plain(inner) => inner.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Gzip(encoder) => encoder.flush(),
            Self::Bzip2(encoder) => encoder.flush(),
            Self::Xz(encoder) => encoder.flush(),
            Self::Plain(inner) => inner.flush(),
        }
    }
}

/// Kind of an archived [Entry].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    /// Symbolic link pointing to the contained target.
    Symlink(PathBuf),
}

/// A single file system object inside an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Path relative to the archived directory.
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Permission bits including setuid, setgid and sticky bit.
    pub mode: u32,
    /// Size of the content in bytes. Zero for everything but files.
    pub size: u64,
    /// Modification time in seconds since the epoch.
    pub mtime: u64,
}

#[derive(Debug, Display, Error)]
/// Errors on creating an archive.
pub enum ArchiveWriteError {
    /// The directory to archive could not be read.
    #[display("Reading {} failed: {source}", path.display())]
    Source { path: PathBuf, source: io::Error },
    /// Writing the archive file failed.
    #[display("Writing archive {} failed: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Debug, Display, Error)]
/// Errors on reading or extracting an archive.
pub enum ArchiveReadError {
    #[display("Opening archive {} failed: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },
    /// The archive is corrupt or writing an extracted entry failed.
    #[display("Reading archive {} failed: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    /// An entry would be written outside of the destination directory.
    #[display("Archive {} contains unsafe entry {}", path.display(), entry.display())]
    UnsafePath { path: PathBuf, entry: PathBuf },
}

/// Describes every object below `source_dir`, sorted by path.
///
/// Symbolic links are recorded, not followed. Sockets, fifos and device nodes
/// are skipped.
pub fn collect(source_dir: &Path) -> Result<Vec<Entry>, ArchiveWriteError> {
    let source_err = |path: &Path, source| ArchiveWriteError::Source {
        path: path.to_path_buf(),
        source,
    };

    let mut entries = Vec::new();
    let walker = WalkDir::new(source_dir)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();
    for dir_entry in walker {
        let dir_entry = dir_entry.map_err(|e| {
            let path = e.path().unwrap_or(source_dir).to_path_buf();
            source_err(&path, io::Error::from(e))
        })?;
        let path = dir_entry.path();
        let Ok(relative) = path.strip_prefix(source_dir) else {
            continue;
        };

        let metadata = dir_entry.metadata().map_err(|e| source_err(path, e.into()))?;
        let file_type = metadata.file_type();
        let kind = if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_symlink() {
            EntryKind::Symlink(fs::read_link(path).map_err(|e| source_err(path, e))?)
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            log::warn!(target: "archive", "Skipping special file {}", path.display());
            continue;
        };

        let mtime = metadata
            .modified()
            .ok()
            .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |since_epoch| since_epoch.as_secs());

        entries.push(Entry {
            path: relative.to_path_buf(),
            size: if kind == EntryKind::File { metadata.len() } else { 0 },
            kind,
            mode: metadata.permissions().mode() & 0o7777,
            mtime,
        });
    }

    Ok(entries)
}

/// Streams `entries`, read relative to `source_dir`, as tar into `writer`.
pub fn write_entries<W: Write>(entries: &[Entry], source_dir: &Path, writer: W) -> io::Result<W> {
    let mut builder = Builder::new(writer);

    for entry in entries {
        let mut header = Header::new_gnu();
        header.set_mode(entry.mode);
        header.set_mtime(entry.mtime);

        match &entry.kind {
            EntryKind::Dir => {
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                builder.append_data(&mut header, &entry.path, io::empty())?;
            }
            EntryKind::File => {
                let file = File::open(source_dir.join(&entry.path))?;
                // the file may have changed since it was collected
                let size = file.metadata()?.len();
                append_file(&mut builder, &mut header, &entry.path, file, size)?;
            }
            EntryKind::Symlink(target) => {
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                builder.append_link(&mut header, &entry.path, target)?;
            }
        }
        log::trace!(target: "archive", "Added {}", entry.path.display());
    }

    builder.into_inner()
}

/// Appends exactly `size` bytes of `data` as regular file at `path`.
fn append_file<W: Write, R: Read>(
    builder: &mut Builder<W>,
    header: &mut Header,
    path: &Path,
    data: R,
    size: u64,
) -> io::Result<()> {
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    let mut data = data.take(size);
    builder.append_data(header, path, &mut data)?;
    if data.limit() != 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("{} shrank while being archived", path.display()),
        ));
    }
    Ok(())
}

/// Archives the directory tree `source_dir` into the new file `dest_file`.
///
/// Returns the uncompressed size of all archived files. On failure no file is
/// left behind at `dest_file`.
pub fn create_archive(
    source_dir: &Path,
    dest_file: &Path,
    compression: Compression,
) -> Result<u64, ArchiveWriteError> {
    let entries = collect(source_dir)?;
    write_archive(&entries, source_dir, dest_file, compression)?;

    log::debug!(
        target: "archive",
        "Created {} ({} entries)",
        dest_file.display(),
        entries.len()
    );
    Ok(entries.iter().map(|entry| entry.size).sum())
}

/// Writes the collected `entries` into the new file `dest_file`, removing it on failure.
fn write_archive(
    entries: &[Entry],
    source_dir: &Path,
    dest_file: &Path,
    compression: Compression,
) -> Result<(), ArchiveWriteError> {
    let write_err = |source| ArchiveWriteError::Write {
        path: dest_file.to_path_buf(),
        source,
    };
    let file = File::create_new(dest_file).map_err(write_err)?;

    let written = (|| {
        let encoder = compression.encoder(BufWriter::new(file));
        let encoder = write_entries(entries, source_dir, encoder)?;
        let file = encoder.finish()?.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    })();

    if let Err(e) = written {
        if let Err(rm_err) = fs::remove_file(dest_file) {
            log::warn!(target: "archive", "Removing partial archive {} failed: {rm_err}", dest_file.display());
        }
        return Err(write_err(e));
    }
    Ok(())
}

/// Extracts `src_file` into `dest_dir`, returning the number of extracted entries.
///
/// Entries whose path is absolute, contains `..` or leads through a symbolic
/// link are rejected with [ArchiveReadError::UnsafePath]. Existing files are
/// overwritten.
pub fn extract_archive(
    src_file: &Path,
    dest_dir: &Path,
    compression: Compression,
) -> Result<usize, ArchiveReadError> {
    let read_err = |source| ArchiveReadError::Read {
        path: src_file.to_path_buf(),
        source,
    };

    let mut archive = open(src_file, compression)?;
    fs::create_dir_all(dest_dir).map_err(read_err)?;

    let mut extracted = 0;
    // applied last, read-only directories would prevent extraction otherwise
    let mut dir_modes = Vec::new();

    for entry in archive.entries().map_err(read_err)? {
        let mut entry = entry.map_err(read_err)?;
        let raw_path = entry.path().map_err(read_err)?.into_owned();
        let unsafe_path = || ArchiveReadError::UnsafePath {
            path: src_file.to_path_buf(),
            entry: raw_path.clone(),
        };

        let relative = normalize(&raw_path).ok_or_else(unsafe_path)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        if leads_through_symlink(dest_dir, &relative) {
            return Err(unsafe_path());
        }

        let target = dest_dir.join(&relative);
        let mode = entry.header().mode().map_err(read_err)? & 0o7777;
        let entry_type = entry.header().entry_type();

        match entry_type {
            EntryType::Directory => {
                prepare_target(&target).map_err(read_err)?;
                fs::create_dir_all(&target).map_err(read_err)?;
                dir_modes.push((target, mode));
            }
            EntryType::Regular | EntryType::Continuous => {
                prepare_target(&target).map_err(read_err)?;
                let mut file = File::create(&target).map_err(read_err)?;
                io::copy(&mut entry, &mut file).map_err(read_err)?;
                fs::set_permissions(&target, Permissions::from_mode(mode)).map_err(read_err)?;
            }
            EntryType::Symlink => {
                let link = entry
                    .link_name()
                    .map_err(read_err)?
                    .ok_or_else(unsafe_path)?
                    .into_owned();
                prepare_target(&target).map_err(read_err)?;
                symlink(&link, &target).map_err(read_err)?;
            }
            other => {
                log::warn!(target: "archive", "Skipping unsupported entry {} ({other:?})", raw_path.display());
                continue;
            }
        }
        extracted += 1;
    }

    for (dir, mode) in dir_modes.into_iter().rev() {
        let is_dir = fs::symlink_metadata(&dir).map_err(read_err)?.is_dir();
        if !is_dir {
            return Err(ArchiveReadError::UnsafePath {
                path: src_file.to_path_buf(),
                entry: dir,
            });
        }
        fs::set_permissions(&dir, Permissions::from_mode(mode)).map_err(read_err)?;
    }

    log::debug!(target: "archive", "Extracted {extracted} entries of {} to {}", src_file.display(), dest_dir.display());
    Ok(extracted)
}

/// Describes the entries of an archive without extracting it.
pub fn list_archive(src_file: &Path, compression: Compression) -> Result<Vec<Entry>, ArchiveReadError> {
    let read_err = |source| ArchiveReadError::Read {
        path: src_file.to_path_buf(),
        source,
    };

    let mut archive = open(src_file, compression)?;
    let mut entries = Vec::new();
    for entry in archive.entries().map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let raw_path = entry.path().map_err(read_err)?.into_owned();
        let path = normalize(&raw_path).ok_or_else(|| ArchiveReadError::UnsafePath {
            path: src_file.to_path_buf(),
            entry: raw_path.clone(),
        })?;

        let header = entry.header();
        let kind = match header.entry_type() {
            EntryType::Directory => EntryKind::Dir,
            EntryType::Symlink => EntryKind::Symlink(
                entry
                    .link_name()
                    .map_err(read_err)?
                    .map(|link| link.into_owned())
                    .unwrap_or_default(),
            ),
            EntryType::Regular | EntryType::Continuous => EntryKind::File,
            _ => continue,
        };

        entries.push(Entry {
            path,
            size: if kind == EntryKind::File { header.size().map_err(read_err)? } else { 0 },
            kind,
            mode: header.mode().map_err(read_err)? & 0o7777,
            mtime: header.mtime().map_err(read_err)?,
        });
    }

    Ok(entries)
}

fn open(src_file: &Path, compression: Compression) -> Result<Archive<Box<dyn Read>>, ArchiveReadError> {
    let file = File::open(src_file).map_err(|source| ArchiveReadError::Open {
        path: src_file.to_path_buf(),
        source,
    })?;
    Ok(Archive::new(compression.decoder(BufReader::new(file))))
}

/// Relative path consisting of normal components only.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(normalized)
}

/// Whether any parent of `relative` inside `base` is a symbolic link.
fn leads_through_symlink(base: &Path, relative: &Path) -> bool {
    let Some(parent) = relative.parent() else {
        return false;
    };

    let mut current = base.to_path_buf();
    for component in parent.components() {
        current.push(component);
        let is_symlink = fs::symlink_metadata(&current)
            .map(|metadata| metadata.file_type().is_symlink())
            .unwrap_or(false);
        if is_symlink {
            return true;
        }
    }
    false
}

/// Creates the parent directories and removes whatever non-directory occupies `target`.
///
/// A symbolic link is removed even if it points to a directory.
fn prepare_target(target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::symlink_metadata(target) {
        Ok(metadata) if !metadata.is_dir() => fs::remove_file(target),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(root: &Path) {
        fs::create_dir_all(root.join("htdocs/assets")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(root.join("htdocs/index.html"), "<h1>hello</h1>").unwrap();
        fs::write(root.join("htdocs/assets/app.js"), "console.log(1)").unwrap();
        fs::write(root.join("deploy.sh"), "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(root.join("deploy.sh"), Permissions::from_mode(0o755)).unwrap();
        fs::set_permissions(root.join("htdocs/index.html"), Permissions::from_mode(0o640))
            .unwrap();
        symlink("htdocs/index.html", root.join("current")).unwrap();
    }

    /// Relative path, kind, mode and content of everything below `root`.
    fn snapshot(root: &Path) -> Vec<(PathBuf, EntryKind, u32, Vec<u8>)> {
        collect(root)
            .unwrap()
            .into_iter()
            .map(|entry| {
                let content = match entry.kind {
                    EntryKind::File => fs::read(root.join(&entry.path)).unwrap(),
                    _ => Vec::new(),
                };
                let mode = match entry.kind {
                    EntryKind::Symlink(_) => 0,
                    _ => entry.mode,
                };
                (entry.path, entry.kind, mode, content)
            })
            .collect()
    }

    #[test]
    fn collect_is_sorted_and_relative() {
        let source = tempfile::tempdir().unwrap();
        tree(source.path());

        let paths: Vec<_> = collect(source.path())
            .unwrap()
            .into_iter()
            .map(|entry| entry.path)
            .collect();
        assert_eq!(
            paths,
            [
                "current",
                "deploy.sh",
                "empty",
                "htdocs",
                "htdocs/assets",
                "htdocs/assets/app.js",
                "htdocs/index.html",
            ]
            .map(PathBuf::from)
        );
    }

    #[test]
    fn round_trip_preserves_tree() {
        let source = tempfile::tempdir().unwrap();
        tree(source.path());
        let out = tempfile::tempdir().unwrap();

        for compression in Compression::ALL {
            let archive = out.path().join(format!("tree.{}", compression.extension()));
            let size = create_archive(source.path(), &archive, compression).unwrap();
            assert_eq!(size, 14 + 14 + 17);
            assert_eq!(Compression::detect(&archive).unwrap(), compression);

            let dest = out.path().join(format!("extracted-{compression}"));
            extract_archive(&archive, &dest, compression).unwrap();
            assert_eq!(snapshot(&dest), snapshot(source.path()), "{compression}");
        }
    }

    #[test]
    fn extraction_overwrites_existing_files() {
        let source = tempfile::tempdir().unwrap();
        tree(source.path());
        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("tree.tar.gz");
        create_archive(source.path(), &archive, Compression::Gzip).unwrap();

        let dest = out.path().join("dest");
        extract_archive(&archive, &dest, Compression::Gzip).unwrap();
        fs::write(dest.join("htdocs/index.html"), "defaced").unwrap();
        extract_archive(&archive, &dest, Compression::Gzip).unwrap();

        assert_eq!(snapshot(&dest), snapshot(source.path()));
    }

    #[test]
    fn list_describes_entries() {
        let source = tempfile::tempdir().unwrap();
        tree(source.path());
        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("tree.tar.xz");
        create_archive(source.path(), &archive, Compression::Xz).unwrap();

        let listed = list_archive(&archive, Compression::Xz).unwrap();
        let collected = collect(source.path()).unwrap();
        assert_eq!(listed, collected);
    }

    #[test]
    fn missing_source_leaves_no_archive() {
        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("broken.tar.gz");

        let result = create_archive(&out.path().join("missing"), &archive, Compression::Gzip);
        assert!(matches!(result, Err(ArchiveWriteError::Source { .. })));
        assert!(!archive.exists());
    }

    #[test]
    fn existing_destination_is_not_clobbered() {
        let source = tempfile::tempdir().unwrap();
        tree(source.path());
        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("taken.tar.gz");
        fs::write(&archive, "precious").unwrap();

        let result = create_archive(source.path(), &archive, Compression::Gzip);
        assert!(matches!(result, Err(ArchiveWriteError::Write { .. })));
        assert_eq!(fs::read_to_string(&archive).unwrap(), "precious");
    }

    #[test]
    fn failing_stream_leaves_no_archive() {
        let source = tempfile::tempdir().unwrap();
        tree(source.path());
        let entries = collect(source.path()).unwrap();
        fs::remove_file(source.path().join("htdocs/index.html")).unwrap();
        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("partial.tar.gz");

        let result = write_archive(&entries, source.path(), &archive, Compression::Gzip);
        assert!(matches!(result, Err(ArchiveWriteError::Write { .. })));
        assert!(!archive.exists());
    }

    #[test]
    fn short_file_is_an_error() {
        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_mode(0o644);

        let result = append_file(&mut builder, &mut header, Path::new("log.txt"), &b"abc"[..], 10);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    fn raw_archive(path: &Path, name: &[u8], entry_type: EntryType, link: Option<&str>) {
        let mut header = Header::new_gnu();
        header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
        header.set_entry_type(entry_type);
        header.set_mode(0o644);
        header.set_size(if link.is_some() { 0 } else { 4 });
        if let Some(link) = link {
            header.set_link_name(link).unwrap();
        }
        header.set_cksum();

        let file = File::create(path).unwrap();
        let mut builder = Builder::new(GzEncoder::new(file, flate2::Compression::default()));
        let data: &[u8] = if link.is_some() { b"" } else { b"evil" };
        builder.append(&header, data).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn rejects_parent_dir_entries() {
        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("evil.tar.gz");
        raw_archive(&archive, b"../evil.txt", EntryType::Regular, None);

        let dest = out.path().join("dest");
        let result = extract_archive(&archive, &dest, Compression::Gzip);
        assert!(matches!(result, Err(ArchiveReadError::UnsafePath { .. })));
        assert!(!out.path().join("evil.txt").exists());
        assert!(matches!(
            list_archive(&archive, Compression::Gzip),
            Err(ArchiveReadError::UnsafePath { .. })
        ));
    }

    #[test]
    fn rejects_absolute_entries() {
        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("evil.tar.gz");
        let target = out.path().join("absolute.txt");
        raw_archive(
            &archive,
            target.to_str().unwrap().as_bytes(),
            EntryType::Regular,
            None,
        );

        let result = extract_archive(&archive, &out.path().join("dest"), Compression::Gzip);
        assert!(matches!(result, Err(ArchiveReadError::UnsafePath { .. })));
        assert!(!target.exists());
    }

    #[test]
    fn rejects_writes_through_symlinks() {
        let out = tempfile::tempdir().unwrap();
        let outside = out.path().join("outside");
        fs::create_dir_all(&outside).unwrap();

        let archive = out.path().join("evil.tar.gz");
        let file = File::create(&archive).unwrap();
        let mut builder = Builder::new(GzEncoder::new(file, flate2::Compression::default()));
        let mut link = Header::new_gnu();
        link.set_entry_type(EntryType::Symlink);
        link.set_size(0);
        link.set_mode(0o777);
        builder
            .append_link(&mut link, "escape", &outside)
            .unwrap();
        let mut file_header = Header::new_gnu();
        file_header.set_entry_type(EntryType::Regular);
        file_header.set_size(4);
        file_header.set_mode(0o644);
        builder
            .append_data(&mut file_header, "escape/evil.txt", &b"evil"[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let result = extract_archive(&archive, &out.path().join("dest"), Compression::Gzip);
        assert!(matches!(result, Err(ArchiveReadError::UnsafePath { .. })));
        assert!(!outside.join("evil.txt").exists());
    }

    #[test]
    fn directory_entry_replaces_symlink() {
        let out = tempfile::tempdir().unwrap();
        let outside = out.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::set_permissions(&outside, Permissions::from_mode(0o700)).unwrap();

        let archive = out.path().join("evil.tar.gz");
        let file = File::create(&archive).unwrap();
        let mut builder = Builder::new(GzEncoder::new(file, flate2::Compression::default()));
        let mut link = Header::new_gnu();
        link.set_entry_type(EntryType::Symlink);
        link.set_size(0);
        link.set_mode(0o700);
        builder.append_link(&mut link, "escape", &outside).unwrap();
        let mut dir = Header::new_gnu();
        dir.set_entry_type(EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o777);
        builder.append_data(&mut dir, "escape", io::empty()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let dest = out.path().join("dest");
        extract_archive(&archive, &dest, Compression::Gzip).unwrap();

        let outside_mode = fs::metadata(&outside).unwrap().permissions().mode() & 0o7777;
        assert_eq!(outside_mode, 0o700);
        let escape = fs::symlink_metadata(dest.join("escape")).unwrap();
        assert!(escape.is_dir());
        assert_eq!(escape.permissions().mode() & 0o7777, 0o777);
    }

    #[test]
    fn detects_plain_tar() {
        let out = tempfile::tempdir().unwrap();
        let path = out.path().join("plain");
        fs::write(&path, "not compressed").unwrap();
        assert_eq!(Compression::detect(&path).unwrap(), Compression::None);
    }
}
