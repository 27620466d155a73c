#![warn(clippy::pedantic, clippy::std_instead_of_core)]
#![allow(clippy::enum_glob_use, clippy::missing_errors_doc)]

//! Read, write, and extract Bethesda game archives.
//!
//! Supports every shipped revision of the format family: the Morrowind
//! archive, the legacy BSAs of Oblivion, Fallout 3/NV, and both Skyrim
//! editions, and the BA2s of Fallout 4 and Starfield (general and `DX10`
//! texture contents, including the LZ4-block texture revision). Parsed
//! archives land in a single folder tree regardless of which on-disk layout
//! they came from; payloads stay on disk until a file is extracted.
//!
//! # Reading and extracting
//! ```rust,no_run
//! use bsatk::Archive;
//!
//! fn example() -> bsatk::Result<()> {
//!     let mut archive = Archive::new();
//!     archive.read("Skyrim - Textures.bsa", false)?;
//!     archive.extract_all("out", |percent, name| {
//!         println!("{percent:>3}% {name}");
//!         true
//!     }, true)?;
//!     Ok(())
//! }
//! ```
//!
//! # Writing
//! Only the legacy BSA family can be written back out.
//! ```rust,no_run
//! use bsatk::{Archive, ArchiveType, BStr};
//!
//! fn example() -> bsatk::Result<()> {
//!     let mut archive = Archive::new();
//!     archive.set_type(ArchiveType::Oblivion);
//!     let file = archive.create_file("readme.txt", "local/readme.txt", false);
//!     let folder = archive.tree_mut().find_or_insert_path(BStr::new("docs"));
//!     archive.tree_mut().add_file(folder, file);
//!     archive.write("example.bsa")?;
//!     Ok(())
//! }
//! ```

mod archive;
mod cc;
mod compression;
mod dds;
mod extract;
mod file;
mod folder;
pub mod hashing;
mod io;
mod strings;
#[cfg(test)]
pub(crate) mod testutil;

pub use self::{
    archive::{Archive, ArchiveFlags, ArchiveType, FileFlags},
    file::{FileId, FileRecord, TextureChunk, TextureHeader},
    folder::{Folder, FolderId, FolderTree},
};

pub use bstr::{BStr, BString};

use std::{io as std_io, path::PathBuf};

/// The closed set of failures the archive operations report.
///
/// Stream failures while parsing or extracting collapse into
/// [`InvalidData`](Error::InvalidData), mirroring how the readers treat any
/// truncated or malformed archive.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("archive could not be opened for reading: {0}")]
    FileNotFound(#[source] std_io::Error),

    #[error("output file or directory could not be created: {0}")]
    AccessFailed(#[source] std_io::Error),

    #[error("invalid or corrupt archive data: {0}")]
    InvalidData(#[from] std_io::Error),

    #[error("one or more name hashes did not match their recomputed value")]
    InvalidHashes,

    #[error("the zlib inflate stream could not be initialized")]
    ZlibInitFailed,

    #[error("source file for writing could not be opened: {}", .0.display())]
    SourceFileMissing(PathBuf),

    #[error("not a bsa or ba2 file: magic {0:#010X}")]
    NotAnArchive(u32),

    #[error("invalid archive type: {0:#X}")]
    InvalidType(u32),

    #[error("the operation was canceled")]
    Canceled,
}

pub type Result<T> = core::result::Result<T, Error>;
