use crate::{
    folder::FolderId,
    hashing,
    io::{Endian, Sink, Source},
    strings::ZString,
    Error, Result,
};
use bstr::{BStr, BString};
use std::{
    io::{self, Read, Seek, Write},
    path::{Path, PathBuf},
};

// top two bits of the legacy size field flip the file's compression sense
const COMPRESS_TOGGLE_MASK: u32 = 0xC000_0000;
const COMPRESS_TOGGLE_BIT: u32 = 1 << 30;

/// A handle to a file stored in an [`Archive`](crate::Archive)'s folder tree.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FileId(pub(crate) u32);

/// The stored metadata of a `DX10` texture file.
#[derive(Clone, Copy, Debug, Default)]
pub struct TextureHeader {
    pub name_hash: u32,
    pub extension: [u8; 4],
    pub dir_hash: u32,
    pub unknown1: u8,
    pub chunk_count: u8,
    pub chunk_header_size: u16,
    pub height: u16,
    pub width: u16,
    pub mip_count: u8,
    pub format: u16,
    pub unknown2: u16,
}

/// One slice of a `DX10` texture's payload, compressed independently.
#[derive(Clone, Copy, Debug, Default)]
pub struct TextureChunk {
    pub offset: u64,
    pub packed_size: u32,
    pub unpacked_size: u32,
    pub start_mip: u16,
    pub end_mip: u16,
    pub unknown: u32,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Texture {
    pub(crate) header: TextureHeader,
    pub(crate) chunks: Vec<TextureChunk>,
}

/// A single file inside an archive.
///
/// Records are created by the directory parsers during
/// [`Archive::read`](crate::Archive::read), or staged for writing with
/// [`Archive::create_file`](crate::Archive::create_file).
#[derive(Clone, Debug, Default)]
pub struct FileRecord {
    pub(crate) name: BString,
    pub(crate) folder: Option<FolderId>,
    pub(crate) name_hash: u64,
    pub(crate) file_size: u32,
    pub(crate) uncompressed_size: u32,
    pub(crate) data_offset: u64,
    pub(crate) compress_toggled: bool,
    pub(crate) texture: Option<Texture>,
    pub(crate) source_path: Option<PathBuf>,
}

impl FileRecord {
    pub(crate) fn from_source(name: BString, source_path: PathBuf, compress_toggled: bool) -> Self {
        let name_hash = hashing::hash_path(name.as_ref());
        Self {
            name,
            name_hash,
            compress_toggled,
            source_path: Some(source_path),
            ..Self::default()
        }
    }

    /// The file's basename inside the archive.
    #[must_use]
    pub fn name(&self) -> &BStr {
        self.name.as_ref()
    }

    #[must_use]
    pub fn name_hash(&self) -> u64 {
        self.name_hash
    }

    /// The stored (on-disk) payload size.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.file_size
    }

    /// The decompressed payload size, or 0 when it equals the stored size or
    /// is not known.
    #[must_use]
    pub fn uncompressed_size(&self) -> u32 {
        self.uncompressed_size
    }

    /// The absolute offset of the payload within the source archive.
    #[must_use]
    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    /// Whether this file's compression sense is inverted from the archive
    /// default.
    #[must_use]
    pub fn compress_toggled(&self) -> bool {
        self.compress_toggled
    }

    /// The folder this record belongs to, once it has been added to a tree.
    #[must_use]
    pub fn folder(&self) -> Option<FolderId> {
        self.folder
    }

    #[must_use]
    pub fn texture_header(&self) -> Option<&TextureHeader> {
        self.texture.as_ref().map(|texture| &texture.header)
    }

    #[must_use]
    pub fn texture_chunks(&self) -> &[TextureChunk] {
        self.texture
            .as_ref()
            .map_or(&[][..], |texture| texture.chunks.as_slice())
    }

    /// The local file backing this record, for records staged with
    /// [`Archive::create_file`](crate::Archive::create_file).
    #[must_use]
    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// Reads one legacy file record: `{name_hash: u64, size_flags: u32,
    /// data_offset: u32}`.
    pub(crate) fn read_legacy<R>(source: &mut Source<'_, R>) -> Result<Self>
    where
        R: Read + Seek,
    {
        let (name_hash, size_flags, data_offset): (u64, u32, u32) = source.read(Endian::Little)?;
        Ok(Self {
            name_hash,
            file_size: size_flags & !COMPRESS_TOGGLE_MASK,
            compress_toggled: (size_flags & COMPRESS_TOGGLE_MASK) != 0,
            data_offset: data_offset.into(),
            ..Self::default()
        })
    }

    /// Writes the record back out in the legacy layout, with the current
    /// `file_size` and `data_offset` values.
    pub(crate) fn write_legacy_header<W>(&self, sink: &mut Sink<'_, W>) -> Result<()>
    where
        W: Write + Seek,
    {
        let size_flags = if self.compress_toggled {
            self.file_size | COMPRESS_TOGGLE_BIT
        } else {
            self.file_size
        };
        let data_offset = u32::try_from(self.data_offset).map_err(|_| {
            Error::InvalidData(io::Error::new(
                io::ErrorKind::InvalidData,
                "file data offset does not fit the legacy record layout",
            ))
        })?;
        sink.write(&(self.name_hash, size_flags, data_offset), Endian::Little)?;
        Ok(())
    }

    /// Assigns this record's name from the file-name table at the source's
    /// current position. Returns whether the stored hash matched the name
    /// (always `true` when `test_hashes` is off).
    pub(crate) fn resolve_name<R>(
        &mut self,
        source: &mut Source<'_, R>,
        test_hashes: bool,
    ) -> Result<bool>
    where
        R: Read + Seek,
    {
        self.name = source.read_protocol::<ZString>(Endian::Little)?;
        Ok(!test_hashes || hashing::hash_path(self.name.as_ref()) == self.name_hash)
    }
}
