use crate::{
    compression, extract,
    file::{FileId, FileRecord, Texture, TextureChunk, TextureHeader},
    folder::{FolderId, FolderTree},
    hashing,
    io::{Endian, Sink, Source},
    strings::{BZString, WString, ZString},
    Error, Result,
};
use bstr::{BStr, BString, ByteSlice as _};
use std::{
    fs,
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

bitflags::bitflags! {
    /// The archive-wide flag word of the legacy header.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ArchiveFlags: u32 {
        const HAS_DIR_NAMES = 1 << 0;
        const HAS_FILE_NAMES = 1 << 1;
        /// Files are compressed unless their per-file toggle says otherwise.
        const DEFAULT_COMPRESSED = 1 << 2;
        /// Each payload is preceded by a length-prefixed full path. Honored
        /// on every legacy archive except Oblivion's.
        const NAME_PREFIXED = 1 << 8;
    }
}

impl Default for ArchiveFlags {
    fn default() -> Self {
        Self::HAS_DIR_NAMES | Self::HAS_FILE_NAMES
    }
}

bitflags::bitflags! {
    /// The content-summary word of the legacy header. Computed from file
    /// names when writing; purely informational when reading.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct FileFlags: u32 {
        const NIF = 1 << 0;
        const DDS = 1 << 1;
        const XML = 1 << 2;
        const WAV = 1 << 3;
        const MP3 = 1 << 4;
        const TXT = 1 << 5;
        const SPT = 1 << 6;
        const TEX = 1 << 7;
        const CTL = 1 << 8;
    }
}

impl FileFlags {
    /// Scans file names for the extensions the flag word summarizes.
    #[must_use]
    pub fn detect<'a, I>(names: I) -> Self
    where
        I: IntoIterator<Item = &'a BStr>,
    {
        const TABLE: [(&[u8], FileFlags); 9] = [
            (b".nif", FileFlags::NIF),
            (b".dds", FileFlags::DDS),
            (b".xml", FileFlags::XML),
            (b".wav", FileFlags::WAV),
            (b".mp3", FileFlags::MP3),
            (b".txt", FileFlags::TXT),
            (b".spt", FileFlags::SPT),
            (b".tex", FileFlags::TEX),
            (b".ctl", FileFlags::CTL),
        ];

        let mut flags = Self::empty();
        for name in names {
            for (extension, flag) in TABLE {
                if name.len() >= extension.len()
                    && name[name.len() - extension.len()..].eq_ignore_ascii_case(extension)
                {
                    flags |= flag;
                }
            }
        }
        flags
    }
}

/// The format revision an archive was written for.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ArchiveType {
    Morrowind,
    Oblivion,
    /// Also the Skyrim (Legendary Edition) and Fallout: New Vegas format.
    #[default]
    Fallout3,
    SkyrimSe,
    Fallout4,
    Starfield,
    /// The Starfield texture revision whose chunks are LZ4 blocks.
    StarfieldLz4Texture,
    Fallout4Ng7,
    Fallout4Ng8,
}

impl ArchiveType {
    pub const FALLOUT_NV: Self = Self::Fallout3;
    pub const SKYRIM_LE: Self = Self::Fallout3;

    fn from_id(id: u32) -> Result<Self> {
        match id {
            0x100 => Ok(Self::Morrowind),
            0x67 => Ok(Self::Oblivion),
            0x68 => Ok(Self::Fallout3),
            0x69 => Ok(Self::SkyrimSe),
            0x01 => Ok(Self::Fallout4),
            0x02 => Ok(Self::Starfield),
            0x03 => Ok(Self::StarfieldLz4Texture),
            0x07 => Ok(Self::Fallout4Ng7),
            0x08 => Ok(Self::Fallout4Ng8),
            _ => Err(Error::InvalidType(id)),
        }
    }

    /// The 32-bit identifier stored in the archive header.
    #[must_use]
    pub fn id(self) -> u32 {
        match self {
            Self::Morrowind => 0x100,
            Self::Oblivion => 0x67,
            Self::Fallout3 => 0x68,
            Self::SkyrimSe => 0x69,
            Self::Fallout4 => 0x01,
            Self::Starfield => 0x02,
            Self::StarfieldLz4Texture => 0x03,
            Self::Fallout4Ng7 => 0x07,
            Self::Fallout4Ng8 => 0x08,
        }
    }

    pub(crate) fn is_ba2(self) -> bool {
        matches!(
            self,
            Self::Fallout4
                | Self::Starfield
                | Self::StarfieldLz4Texture
                | Self::Fallout4Ng7
                | Self::Fallout4Ng8
        )
    }

    fn is_legacy(self) -> bool {
        matches!(self, Self::Oblivion | Self::Fallout3 | Self::SkyrimSe)
    }
}

mod constants {
    use crate::cc;

    pub(crate) const BSA: u32 = cc::make_four(b"BSA");
    pub(crate) const BTDX: u32 = cc::make_four(b"BTDX");
    pub(crate) const MORROWIND: u32 = 0x100;

    pub(crate) const GNRL: u32 = cc::make_four(b"GNRL");
    pub(crate) const DX10: u32 = cc::make_four(b"DX10");

    pub(crate) const HEADER_SIZE: u32 = 0x24;
    pub(crate) const MORROWIND_HEADER_SIZE: u64 = 0xC;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Ba2Format {
    Gnrl,
    Dx10,
}

enum Header {
    Legacy {
        archive_type: ArchiveType,
        offset: u32,
        archive_flags: ArchiveFlags,
        folder_count: u32,
        file_name_length: u32,
    },
    Ba2 {
        archive_type: ArchiveType,
        format: Ba2Format,
        file_count: u32,
        name_table_offset: u64,
    },
    Morrowind {
        hash_offset: u32,
        file_count: u32,
    },
}

pub(crate) fn archive_not_open() -> Error {
    Error::InvalidData(io::Error::new(
        io::ErrorKind::NotConnected,
        "no archive is open",
    ))
}

/// A Bethesda game archive: a folder tree parsed from one of the seven
/// on-disk layouts, plus the open handle payloads are extracted through.
pub struct Archive {
    pub(crate) file: Option<fs::File>,
    pub(crate) tree: FolderTree,
    archive_type: ArchiveType,
    flags: ArchiveFlags,
}

impl Default for Archive {
    fn default() -> Self {
        Self::new()
    }
}

impl Archive {
    #[must_use]
    pub fn new() -> Self {
        Self {
            file: None,
            tree: FolderTree::new(),
            archive_type: ArchiveType::default(),
            flags: ArchiveFlags::default(),
        }
    }

    #[must_use]
    pub fn archive_type(&self) -> ArchiveType {
        self.archive_type
    }

    pub fn set_type(&mut self, archive_type: ArchiveType) {
        self.archive_type = archive_type;
    }

    #[must_use]
    pub fn flags(&self) -> ArchiveFlags {
        self.flags
    }

    /// The root of the folder tree.
    #[must_use]
    pub fn root(&self) -> FolderId {
        self.tree.root()
    }

    #[must_use]
    pub fn tree(&self) -> &FolderTree {
        &self.tree
    }

    /// Mutable tree access, for staging folders and files ahead of a
    /// [`write`](Self::write).
    pub fn tree_mut(&mut self) -> &mut FolderTree {
        &mut self.tree
    }

    #[must_use]
    pub fn count_files(&self) -> usize {
        self.tree.count_files()
    }

    #[must_use]
    pub fn collect_folder_names(&self) -> Vec<BString> {
        self.tree.collect_folder_names()
    }

    #[must_use]
    pub fn collect_file_names(&self) -> Vec<BString> {
        self.tree.collect_file_names()
    }

    /// Drops the open file handle. The parsed tree stays available.
    pub fn close(&mut self) {
        self.file = None;
    }

    pub(crate) fn default_compressed(&self) -> bool {
        self.flags.contains(ArchiveFlags::DEFAULT_COMPRESSED)
    }

    /// Whether payloads are preceded by a length-prefixed full path.
    pub(crate) fn name_prefixed(&self) -> bool {
        self.archive_type != ArchiveType::Oblivion
            && self.flags.contains(ArchiveFlags::NAME_PREFIXED)
    }

    /// The file's effective compression: the per-file toggle XOR-ed with the
    /// archive default, except on the BA2 family where a nonzero packed size
    /// is the only signal.
    #[must_use]
    pub fn compressed(&self, file: FileId) -> bool {
        let record = self.tree.file(file);
        if self.archive_type.is_ba2() {
            record.file_size > 0
        } else {
            record.compress_toggled != self.default_compressed()
        }
    }

    /// Stages a new file record backed by a local file. The record still has
    /// to be placed in a folder via
    /// [`FolderTree::add_file`](crate::FolderTree::add_file).
    pub fn create_file<N, P>(&self, name: N, source_path: P, compressed: bool) -> FileRecord
    where
        N: Into<BString>,
        P: Into<PathBuf>,
    {
        FileRecord::from_source(
            name.into(),
            source_path.into(),
            self.default_compressed() != compressed,
        )
    }

    /// Parses the archive at `path` into the folder tree and keeps the file
    /// open for extraction.
    ///
    /// With `test_hashes`, every resolved file name is re-hashed and compared
    /// against its stored hash; mismatches finish the parse but report
    /// [`Error::InvalidHashes`].
    pub fn read<P>(&mut self, path: P, test_hashes: bool) -> Result<()>
    where
        P: AsRef<Path>,
    {
        self.close();
        self.tree = FolderTree::new();

        let mut file = fs::File::open(path).map_err(Error::FileNotFound)?;
        let mut source = Source::new(&mut file);
        let header = Self::read_header(&mut source)?;

        let mut hashes_valid = true;
        match header {
            Header::Ba2 {
                archive_type,
                format,
                file_count,
                name_table_offset,
            } => {
                Self::read_ba2(
                    &mut self.tree,
                    &mut source,
                    archive_type,
                    format,
                    file_count,
                    name_table_offset,
                )?;
                self.archive_type = archive_type;
                self.flags = ArchiveFlags::default();
            }
            Header::Morrowind {
                hash_offset,
                file_count,
            } => {
                Self::read_morrowind(&mut self.tree, &mut source, hash_offset, file_count)?;
                self.archive_type = ArchiveType::Morrowind;
                self.flags = ArchiveFlags::default();
            }
            Header::Legacy {
                archive_type,
                offset,
                archive_flags,
                folder_count,
                file_name_length,
            } => {
                hashes_valid = Self::read_legacy(
                    &mut self.tree,
                    &mut source,
                    archive_type,
                    offset,
                    folder_count,
                    file_name_length,
                    test_hashes,
                )?;
                self.archive_type = archive_type;
                self.flags = archive_flags;
            }
        }

        self.file = Some(file);
        if hashes_valid {
            Ok(())
        } else {
            Err(Error::InvalidHashes)
        }
    }

    fn read_header<R>(source: &mut Source<'_, R>) -> Result<Header>
    where
        R: Read + Seek,
    {
        let magic: u32 = source.read(Endian::Little)?;
        match magic {
            constants::MORROWIND => {
                let (hash_offset, file_count) = source.read(Endian::Little)?;
                Ok(Header::Morrowind {
                    hash_offset,
                    file_count,
                })
            }
            constants::BSA => {
                let type_id: u32 = source.read(Endian::Little)?;
                let archive_type = ArchiveType::from_id(type_id)?;
                if !archive_type.is_legacy() {
                    return Err(Error::InvalidType(type_id));
                }
                let (
                    offset,
                    archive_flags,
                    folder_count,
                    _file_count,
                    _folder_name_length,
                    file_name_length,
                    _file_flags,
                ): (u32, u32, u32, u32, u32, u32, u32) = source.read(Endian::Little)?;
                Ok(Header::Legacy {
                    archive_type,
                    offset,
                    archive_flags: ArchiveFlags::from_bits_truncate(archive_flags),
                    folder_count,
                    file_name_length,
                })
            }
            constants::BTDX => {
                let type_id: u32 = source.read(Endian::Little)?;
                let archive_type = ArchiveType::from_id(type_id)?;
                if !archive_type.is_ba2() {
                    return Err(Error::InvalidType(type_id));
                }
                let contents: u32 = source.read(Endian::Little)?;
                let format = match contents {
                    constants::GNRL => Ba2Format::Gnrl,
                    constants::DX10 => Ba2Format::Dx10,
                    _ => {
                        return Err(Error::InvalidData(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("unknown ba2 contents format: {contents:#010X}"),
                        )))
                    }
                };
                let (file_count, name_table_offset): (u32, u64) = source.read(Endian::Little)?;
                Ok(Header::Ba2 {
                    archive_type,
                    format,
                    file_count,
                    name_table_offset,
                })
            }
            _ => Err(Error::NotAnArchive(magic)),
        }
    }

    /// Splits a full path from a name table into its folder chain and
    /// basename, then files the record under the resulting folder.
    fn insert_path_file(tree: &mut FolderTree, full_path: &BStr, mut record: FileRecord) -> FileId {
        let (folder_path, basename) = match full_path.iter().rposition(|&b| b == b'\\' || b == b'/')
        {
            Some(pos) => (&full_path[..pos], &full_path[pos + 1..]),
            None => (BStr::new(&b""[..]), &full_path[..]),
        };
        let folder = tree.find_or_insert_path(folder_path.as_bstr());
        record.name = basename.into();
        record.name_hash = hashing::hash_path(basename.as_bstr());
        tree.add_file(folder, record)
    }

    fn read_legacy<R>(
        tree: &mut FolderTree,
        source: &mut Source<'_, R>,
        archive_type: ArchiveType,
        offset: u32,
        folder_count: u32,
        file_name_length: u32,
        test_hashes: bool,
    ) -> Result<bool>
    where
        R: Read + Seek,
    {
        // folder records follow the header directly; the name table begins
        // where the last folder's content block ends
        let mut end_pos = u64::from(offset);
        let mut parsed_files = Vec::new();

        for _ in 0..folder_count {
            let name_hash: u64 = source.read(Endian::Little)?;
            let file_count: u32 = source.read(Endian::Little)?;
            let data_offset = if archive_type == ArchiveType::SkyrimSe {
                let (_padding, data_offset): (u32, u64) = source.read(Endian::Little)?;
                data_offset
            } else {
                let data_offset: u32 = source.read(Endian::Little)?;
                u64::from(data_offset)
            };

            source.save_restore_position(|source| -> Result<()> {
                let block_offset = data_offset
                    .checked_sub(u64::from(file_name_length))
                    .ok_or_else(|| {
                        Error::InvalidData(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "folder record offset underflows the file name table length",
                        ))
                    })?;
                source.seek(SeekFrom::Start(block_offset))?;

                let name = source.read_protocol::<BZString>(Endian::Little)?;
                let folder_id = tree.find_or_insert_path(name.as_ref());
                {
                    let folder = tree.folder_mut(folder_id);
                    folder.name_hash = name_hash;
                    folder.offset = data_offset;
                }
                for _ in 0..file_count {
                    let record = FileRecord::read_legacy(source)?;
                    parsed_files.push(tree.add_file(folder_id, record));
                }
                end_pos = end_pos.max(source.stream_position()?);
                Ok(())
            })??;
        }

        source.seek(SeekFrom::Start(end_pos))?;
        let mut hashes_valid = true;
        for id in parsed_files {
            if !tree.file_mut(id).resolve_name(source, test_hashes)? {
                hashes_valid = false;
            }
        }
        Ok(hashes_valid)
    }

    fn read_ba2<R>(
        tree: &mut FolderTree,
        source: &mut Source<'_, R>,
        archive_type: ArchiveType,
        format: Ba2Format,
        file_count: u32,
        name_table_offset: u64,
    ) -> Result<()>
    where
        R: Read + Seek,
    {
        // the name table is indexed positionally by file record index
        source.seek(SeekFrom::Start(name_table_offset))?;
        let mut names = Vec::with_capacity(file_count as usize);
        for _ in 0..file_count {
            names.push(source.read_protocol::<WString>(Endian::Little)?);
        }

        let records_offset = match archive_type {
            ArchiveType::Starfield => 32,
            ArchiveType::StarfieldLz4Texture => 36,
            _ => 24,
        };
        source.seek(SeekFrom::Start(records_offset))?;

        for name in &names {
            let record = match format {
                Ba2Format::Gnrl => {
                    let _name_hash: u32 = source.read(Endian::Little)?;
                    let mut extension = [0u8; 4];
                    source.read_bytes(&mut extension)?;
                    let (_dir_hash, _unknown): (u32, u32) = source.read(Endian::Little)?;
                    let (data_offset, packed_size, unpacked_size, _unknown2): (u64, u32, u32, u32) =
                        source.read(Endian::Little)?;
                    FileRecord {
                        file_size: packed_size,
                        uncompressed_size: unpacked_size,
                        data_offset,
                        ..FileRecord::default()
                    }
                }
                Ba2Format::Dx10 => {
                    let name_hash: u32 = source.read(Endian::Little)?;
                    let mut extension = [0u8; 4];
                    source.read_bytes(&mut extension)?;
                    let (
                        dir_hash,
                        unknown1,
                        chunk_count,
                        chunk_header_size,
                        height,
                        width,
                        mip_count,
                        texture_format,
                        unknown2,
                    ): (u32, u8, u8, u16, u16, u16, u8, u16, u8) = source.read(Endian::Little)?;
                    let header = TextureHeader {
                        name_hash,
                        extension,
                        dir_hash,
                        unknown1,
                        chunk_count,
                        chunk_header_size,
                        height,
                        width,
                        mip_count,
                        format: texture_format,
                        unknown2: u16::from(unknown2),
                    };

                    let mut chunks = Vec::with_capacity(chunk_count.into());
                    for _ in 0..chunk_count {
                        let (offset, packed_size, unpacked_size, start_mip, end_mip, unknown): (
                            u64,
                            u32,
                            u32,
                            u16,
                            u16,
                            u32,
                        ) = source.read(Endian::Little)?;
                        chunks.push(TextureChunk {
                            offset,
                            packed_size,
                            unpacked_size,
                            start_mip,
                            end_mip,
                            unknown,
                        });
                    }

                    let first = chunks.first().copied().unwrap_or_default();
                    let total_unpacked = chunks
                        .iter()
                        .fold(0u32, |sum, chunk| sum.saturating_add(chunk.unpacked_size));
                    FileRecord {
                        file_size: first.packed_size,
                        uncompressed_size: total_unpacked,
                        data_offset: first.offset,
                        texture: Some(Texture { header, chunks }),
                        ..FileRecord::default()
                    }
                }
            };
            Self::insert_path_file(tree, name.as_ref(), record);
        }

        Ok(())
    }

    fn read_morrowind<R>(
        tree: &mut FolderTree,
        source: &mut Source<'_, R>,
        hash_offset: u32,
        file_count: u32,
    ) -> Result<()>
    where
        R: Read + Seek,
    {
        let data_offset_base = constants::MORROWIND_HEADER_SIZE
            + u64::from(hash_offset)
            + u64::from(file_count) * 8;

        let mut size_offsets = Vec::with_capacity(file_count as usize);
        for _ in 0..file_count {
            let entry: (u32, u32) = source.read(Endian::Little)?;
            size_offsets.push(entry);
        }
        let mut name_offsets = Vec::with_capacity(file_count as usize);
        for _ in 0..file_count {
            name_offsets.push(source.read::<u32>(Endian::Little)?);
        }

        // name lengths derive from successive offsets; the final entry runs
        // to the end of the name region
        let name_region_length = hash_offset.checked_sub(12 * file_count).ok_or_else(|| {
            Error::InvalidData(io::Error::new(
                io::ErrorKind::InvalidData,
                "morrowind hash table offset is smaller than its record tables",
            ))
        })?;

        for (index, &(size, offset)) in size_offsets.iter().enumerate() {
            let length = if index + 1 == file_count as usize {
                name_region_length
            } else {
                name_offsets[index + 1].wrapping_sub(name_offsets[index])
            };
            let raw = source.read_bytes_vec(length as usize)?;
            let name = match raw.iter().position(|&b| b == 0) {
                Some(pos) => &raw[..pos],
                None => &raw[..],
            };
            Self::insert_path_file(
                tree,
                name.as_bstr(),
                FileRecord {
                    file_size: size,
                    data_offset: data_offset_base + u64::from(offset),
                    ..FileRecord::default()
                },
            );
        }

        Ok(())
    }

    /// Extracts a single file into `output_directory`, named by its basename.
    pub fn extract<P>(&mut self, file: FileId, output_directory: P) -> Result<()>
    where
        P: AsRef<Path>,
    {
        let job = self.file_job(file, false);
        let archive_type = self.archive_type;
        let name_prefixed = self.name_prefixed();

        let stream = self.file.as_mut().ok_or_else(archive_not_open)?;
        let payload = extract::read_payload(stream, archive_type, name_prefixed, &job)?;

        let path = output_directory.as_ref().join(&job.relative_path);
        let mut out = fs::File::create(path).map_err(Error::AccessFailed)?;
        extract::write_payload(&mut out, archive_type, &job, &payload)
    }

    /// Writes the archive in the legacy BSA layout. Only the legacy family
    /// can be written; the tree must hold at least one populated folder.
    ///
    /// Folder records carry absolute offsets that are only known once the
    /// payloads have been laid out, so emission runs in two passes: stubbed
    /// records first, then a rewind to re-emit them with final offsets.
    pub fn write<P>(&mut self, path: P) -> Result<()>
    where
        P: AsRef<Path>,
    {
        if !self.archive_type.is_legacy() {
            return Err(Error::InvalidType(self.archive_type.id()));
        }

        let folders = {
            let mut folders = self.tree.collect_folders();
            folders.sort_by_key(|&id| self.tree.folder(id).name_hash());
            folders
        };
        let folder_files: Vec<Vec<FileId>> = folders
            .iter()
            .map(|&id| {
                let mut files = self.tree.folder(id).files().to_vec();
                files.sort_by_key(|&file| self.tree.file(file).name_hash());
                files
            })
            .collect();

        let folder_names: Vec<BString> =
            folders.iter().map(|&id| self.tree.full_path(id)).collect();
        let file_names: Vec<BString> = folder_files
            .iter()
            .flatten()
            .map(|&file| self.tree.file(file).name.clone())
            .collect();

        // name length fields count the null terminators, but not the folder
        // names' length prefix bytes
        let folder_name_length: u32 = folder_names.iter().map(|name| name.len() as u32 + 1).sum();
        let file_name_length: u32 = file_names.iter().map(|name| name.len() as u32 + 1).sum();
        let file_flags = FileFlags::detect(file_names.iter().map(|name| name.as_bstr()));

        let mut out = fs::File::create(path).map_err(Error::AccessFailed)?;
        let mut sink = Sink::new(&mut out);
        sink.write(
            &(
                constants::BSA,
                self.archive_type.id(),
                constants::HEADER_SIZE,
                self.flags.bits(),
                folders.len() as u32,
                file_names.len() as u32,
                folder_name_length,
                file_name_length,
                file_flags.bits(),
            ),
            Endian::Little,
        )?;

        // pass 1: folder and file records with stubbed offsets
        self.write_folder_records(&mut sink, &folders)?;
        self.write_folder_blocks(&mut sink, &folders, &folder_files, file_name_length)?;

        for name in &file_names {
            sink.write_protocol::<ZString>(name, Endian::Little)?;
        }

        for files in &folder_files {
            for &file in files {
                let offset = sink.stream_position()?;
                let payload = self.load_payload_for_write(file)?;
                let record = self.tree.file_mut(file);
                record.data_offset = offset;
                if let Some((file_size, uncompressed_size)) = payload.sizes {
                    record.file_size = file_size;
                    record.uncompressed_size = uncompressed_size;
                }
                sink.write_bytes(&payload.data)?;
            }
        }

        // pass 2: re-emit the records, this time with the real offsets
        sink.seek(SeekFrom::Start(u64::from(constants::HEADER_SIZE)))?;
        self.write_folder_records(&mut sink, &folders)?;
        self.write_folder_blocks(&mut sink, &folders, &folder_files, file_name_length)?;

        Ok(())
    }

    fn write_folder_records<W>(&self, sink: &mut Sink<'_, W>, folders: &[FolderId]) -> Result<()>
    where
        W: Write + Seek,
    {
        for &id in folders {
            let folder = self.tree.folder(id);
            sink.write(
                &(folder.name_hash(), folder.files().len() as u32),
                Endian::Little,
            )?;
            if self.archive_type == ArchiveType::SkyrimSe {
                sink.write(&(0u32, folder.write_offset), Endian::Little)?;
            } else {
                let offset = u32::try_from(folder.write_offset).map_err(|_| {
                    Error::InvalidData(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "folder offset does not fit the legacy record layout",
                    ))
                })?;
                sink.write(&offset, Endian::Little)?;
            }
        }
        Ok(())
    }

    fn write_folder_blocks<W>(
        &mut self,
        sink: &mut Sink<'_, W>,
        folders: &[FolderId],
        folder_files: &[Vec<FileId>],
        file_name_length: u32,
    ) -> Result<()>
    where
        W: Write + Seek,
    {
        for (&id, files) in folders.iter().zip(folder_files) {
            let write_offset = sink.stream_position()? + u64::from(file_name_length);
            self.tree.folder_mut(id).write_offset = write_offset;

            let full_path = self.tree.full_path(id);
            sink.write_protocol::<BZString>(&full_path, Endian::Little)?;
            for &file in files {
                self.tree.file(file).write_legacy_header(sink)?;
            }
        }
        Ok(())
    }

    /// The bytes to place in the output archive for one file: either the
    /// staged local file (deflated if the file is effectively compressed), or
    /// a verbatim copy of the payload from the source archive.
    fn load_payload_for_write(&mut self, file: FileId) -> Result<WritePayload> {
        let record = self.tree.file(file);
        if let Some(source_path) = record.source_path.clone() {
            let raw = fs::read(&source_path).map_err(|_| Error::SourceFileMissing(source_path))?;
            if self.compressed(file) {
                let packed = compression::zlib_compress(&raw)?;
                let mut data = (raw.len() as u32).to_le_bytes().to_vec();
                data.extend(packed);
                let file_size = data.len() as u32;
                Ok(WritePayload {
                    sizes: Some((file_size, raw.len() as u32)),
                    data,
                })
            } else {
                let file_size = raw.len() as u32;
                Ok(WritePayload {
                    sizes: Some((file_size, 0)),
                    data: raw,
                })
            }
        } else {
            let (data_offset, file_size) = (record.data_offset, record.file_size);
            let stream = self.file.as_mut().ok_or_else(archive_not_open)?;
            stream.seek(SeekFrom::Start(data_offset))?;
            let mut data = vec![0u8; file_size as usize];
            stream.read_exact(&mut data)?;
            Ok(WritePayload { sizes: None, data })
        }
    }
}

struct WritePayload {
    data: Vec<u8>,
    /// New `(file_size, uncompressed_size)` values for staged files; `None`
    /// when the payload was copied verbatim and the sizes are unchanged.
    sizes: Option<(u32, u32)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, LegacyArchiveBuilder};
    use anyhow::Context as _;
    use bstr::ByteSlice as _;

    #[test]
    fn default_state() {
        let archive = Archive::new();
        assert_eq!(archive.archive_type(), ArchiveType::Fallout3);
        assert_eq!(archive.flags(), ArchiveFlags::default());
        assert_eq!(archive.count_files(), 0);
    }

    #[test]
    fn type_ids_round_trip() -> anyhow::Result<()> {
        let types = [
            ArchiveType::Morrowind,
            ArchiveType::Oblivion,
            ArchiveType::Fallout3,
            ArchiveType::SkyrimSe,
            ArchiveType::Fallout4,
            ArchiveType::Starfield,
            ArchiveType::StarfieldLz4Texture,
            ArchiveType::Fallout4Ng7,
            ArchiveType::Fallout4Ng8,
        ];
        for archive_type in types {
            assert_eq!(ArchiveType::from_id(archive_type.id())?, archive_type);
        }
        assert!(matches!(
            ArchiveType::from_id(0x42),
            Err(Error::InvalidType(0x42))
        ));
        assert_eq!(ArchiveType::SKYRIM_LE, ArchiveType::Fallout3);
        Ok(())
    }

    #[test]
    fn file_flags_detection() {
        let names = [
            BString::from("cuirass.nif"),
            BString::from("IRON.DDS"),
            BString::from("readme.txt"),
        ];
        let flags = FileFlags::detect(names.iter().map(|name| name.as_bstr()));
        assert_eq!(flags, FileFlags::NIF | FileFlags::DDS | FileFlags::TXT);
    }

    #[test]
    fn rejects_foreign_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("not_an_archive.bsa");
        std::fs::write(&path, b"PK\x03\x04and then some")?;

        let mut archive = Archive::new();
        match archive.read(&path, false) {
            Err(Error::NotAnArchive(0x0403_4B50)) => Ok(()),
            other => anyhow::bail!("expected NotAnArchive, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_type_ids() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bad_type.bsa");
        let mut bytes = b"BSA\0".to_vec();
        bytes.extend(0x42u32.to_le_bytes());
        bytes.extend([0u8; 28]);
        std::fs::write(&path, bytes)?;

        let mut archive = Archive::new();
        match archive.read(&path, false) {
            Err(Error::InvalidType(0x42)) => Ok(()),
            other => anyhow::bail!("expected InvalidType, got {other:?}"),
        }
    }

    #[test]
    fn missing_input_reports_file_not_found() {
        let mut archive = Archive::new();
        assert!(matches!(
            archive.read("/nonexistent/archive.bsa", false),
            Err(Error::FileNotFound(_))
        ));
    }

    #[test]
    fn parses_an_oblivion_store_archive() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("store.bsa");
        let bytes = LegacyArchiveBuilder::new(ArchiveType::Oblivion)
            .folder("textures", &[("t.dds", &[1, 2, 3, 4, 5, 6, 7, 8])])
            .build();
        std::fs::write(&path, bytes)?;

        let mut archive = Archive::new();
        archive.read(&path, true).context("read failed")?;
        assert_eq!(archive.archive_type(), ArchiveType::Oblivion);
        assert_eq!(archive.count_files(), 1);

        let tree = archive.tree();
        let files = tree.collect_files();
        assert_eq!(files.len(), 1);
        let record = tree.file(files[0]);
        assert_eq!(record.name(), b"t.dds".as_bstr());
        assert_eq!(record.size(), 8);
        assert_eq!(
            tree.collect_folder_names(),
            vec![BString::from("textures")]
        );
        assert!(!archive.compressed(files[0]));

        archive.extract(files[0], dir.path())?;
        let extracted = std::fs::read(dir.path().join("t.dds"))?;
        assert_eq!(extracted, [1, 2, 3, 4, 5, 6, 7, 8]);
        Ok(())
    }

    #[test]
    fn parses_a_compressed_skyrim_le_archive() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("compressed.bsa");
        let bytes = LegacyArchiveBuilder::new(ArchiveType::Fallout3)
            .flags(ArchiveFlags::default() | ArchiveFlags::DEFAULT_COMPRESSED)
            .folder(
                "textures",
                &[("t.dds", &testutil::zlib_payload(b"ABCDEFGH"))],
            )
            .build();
        std::fs::write(&path, bytes)?;

        let mut archive = Archive::new();
        archive.read(&path, true)?;
        let files = archive.tree().collect_files();
        assert!(archive.compressed(files[0]));

        archive.extract(files[0], dir.path())?;
        let extracted = std::fs::read(dir.path().join("t.dds"))?;
        assert_eq!(extracted, b"ABCDEFGH");
        Ok(())
    }

    #[test]
    fn parses_wide_skyrim_se_records_and_lz4_payloads() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("se.bsa");
        let bytes = LegacyArchiveBuilder::new(ArchiveType::SkyrimSe)
            .flags(ArchiveFlags::default() | ArchiveFlags::DEFAULT_COMPRESSED)
            .folder("strings", &[("hello.txt", &testutil::lz4_payload(b"hello"))])
            .build();
        std::fs::write(&path, bytes)?;

        let mut archive = Archive::new();
        archive.read(&path, true)?;
        let files = archive.tree().collect_files();
        assert_eq!(files.len(), 1);
        assert!(archive.compressed(files[0]));

        archive.extract(files[0], dir.path())?;
        let extracted = std::fs::read(dir.path().join("hello.txt"))?;
        assert_eq!(extracted, b"hello");
        Ok(())
    }

    #[test]
    fn name_prefixed_payloads_are_stripped() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("prefixed.bsa");
        let mut payload = vec![b"textures\\t.dds".len() as u8];
        payload.extend_from_slice(b"textures\\t.dds");
        payload.extend_from_slice(&[9, 9, 9]);
        let bytes = LegacyArchiveBuilder::new(ArchiveType::Fallout3)
            .flags(ArchiveFlags::default() | ArchiveFlags::NAME_PREFIXED)
            .folder("textures", &[("t.dds", &payload)])
            .build();
        std::fs::write(&path, bytes)?;

        let mut archive = Archive::new();
        archive.read(&path, true)?;
        let files = archive.tree().collect_files();
        archive.extract(files[0], dir.path())?;
        let extracted = std::fs::read(dir.path().join("t.dds"))?;
        assert_eq!(extracted, [9, 9, 9]);
        Ok(())
    }

    #[test]
    fn hash_validation_reports_mismatches() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("badhash.bsa");
        let bytes = LegacyArchiveBuilder::new(ArchiveType::Oblivion)
            .corrupt_file_hashes()
            .folder("textures", &[("t.dds", &[1, 2, 3])])
            .build();
        std::fs::write(&path, bytes)?;

        let mut archive = Archive::new();
        assert!(matches!(archive.read(&path, true), Err(Error::InvalidHashes)));
        // the parse still completed
        assert_eq!(archive.count_files(), 1);

        let mut archive = Archive::new();
        archive.read(&path, false).context("lenient read failed")?;
        Ok(())
    }

    #[test]
    fn parses_a_morrowind_archive() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mw.bsa");
        let bytes = testutil::morrowind_bytes(&[("data\\file.txt", b"abc")]);
        std::fs::write(&path, bytes)?;

        let mut archive = Archive::new();
        archive.read(&path, false)?;
        assert_eq!(archive.archive_type(), ArchiveType::Morrowind);
        let tree = archive.tree();
        let files = tree.collect_files();
        assert_eq!(files.len(), 1);
        assert_eq!(tree.file_path(files[0]), b"data\\file.txt".as_bstr());
        assert_eq!(tree.file(files[0]).size(), 3);

        archive.extract(files[0], dir.path())?;
        assert_eq!(std::fs::read(dir.path().join("file.txt"))?, b"abc");
        Ok(())
    }

    #[test]
    fn morrowind_name_lengths_derive_from_successive_offsets() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mw.bsa");
        let bytes = testutil::morrowind_bytes(&[
            ("meshes\\a.nif", b"first"),
            ("meshes\\b.nif", b"second!"),
        ]);
        std::fs::write(&path, bytes)?;

        let mut archive = Archive::new();
        archive.read(&path, false)?;
        let tree = archive.tree();
        let files = tree.collect_files();
        assert_eq!(files.len(), 2);
        assert_eq!(tree.file_path(files[0]), b"meshes\\a.nif".as_bstr());
        assert_eq!(tree.file_path(files[1]), b"meshes\\b.nif".as_bstr());
        // both land in the same folder node
        assert_eq!(tree.collect_folders().len(), 1);

        archive.extract(files[1], dir.path())?;
        assert_eq!(std::fs::read(dir.path().join("b.nif"))?, b"second!");
        Ok(())
    }

    #[test]
    fn parses_a_gnrl_ba2() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("general.ba2");
        let bytes = testutil::ba2_gnrl_bytes(&[("meshes\\a.nif", b"\xDE\xAD\xBE\xEF")]);
        std::fs::write(&path, bytes)?;

        let mut archive = Archive::new();
        archive.read(&path, false)?;
        assert_eq!(archive.archive_type(), ArchiveType::Fallout4);
        let tree = archive.tree();
        let files = tree.collect_files();
        assert_eq!(files.len(), 1);
        assert_eq!(tree.file_path(files[0]), b"meshes\\a.nif".as_bstr());
        assert!(!archive.compressed(files[0]));

        archive.extract(files[0], dir.path())?;
        assert_eq!(std::fs::read(dir.path().join("a.nif"))?, b"\xDE\xAD\xBE\xEF");
        Ok(())
    }

    #[test]
    fn parses_a_dx10_ba2_and_rebuilds_the_dds_envelope() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("textures.ba2");
        let payload = vec![0x5Au8; 32768];
        let bytes = testutil::ba2_dx10_bytes("textures\\t.dds", 256, 256, 1, 71, &payload);
        std::fs::write(&path, bytes)?;

        let mut archive = Archive::new();
        archive.read(&path, false)?;
        let tree = archive.tree();
        let files = tree.collect_files();
        assert_eq!(files.len(), 1);
        let record = tree.file(files[0]);
        let header = record.texture_header().context("missing texture header")?;
        assert_eq!((header.width, header.height), (256, 256));
        assert_eq!(record.texture_chunks().len(), 1);
        assert_eq!(record.uncompressed_size(), 32768);

        archive.extract(files[0], dir.path())?;
        let extracted = std::fs::read(dir.path().join("t.dds"))?;
        assert_eq!(extracted.len(), 4 + 124 + 32768);
        assert_eq!(&extracted[..4], b"DDS ");
        assert_eq!(&extracted[84..88], b"DXT1");
        assert_eq!(&extracted[128..], payload.as_slice());
        Ok(())
    }

    #[test]
    fn writes_a_legacy_archive_that_reads_back() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source_a = dir.path().join("a.txt");
        let source_b = dir.path().join("b.nif");
        std::fs::write(&source_a, b"alpha contents")?;
        std::fs::write(&source_b, b"beta contents beta contents beta contents")?;

        let out_path = dir.path().join("written.bsa");
        {
            let mut archive = Archive::new();
            archive.set_type(ArchiveType::Oblivion);
            let file_a = archive.create_file("a.txt", &source_a, false);
            let file_b = archive.create_file("b.nif", &source_b, true);
            let docs = archive.tree_mut().find_or_insert_path(b"docs".as_bstr());
            let meshes = archive.tree_mut().find_or_insert_path(b"meshes".as_bstr());
            archive.tree_mut().add_file(docs, file_a);
            archive.tree_mut().add_file(meshes, file_b);
            archive.write(&out_path)?;
        }

        let mut archive = Archive::new();
        archive.read(&out_path, true).context("re-read failed")?;
        assert_eq!(archive.count_files(), 2);
        let mut folder_names = archive.collect_folder_names();
        folder_names.sort();
        assert_eq!(
            folder_names,
            vec![BString::from("docs"), BString::from("meshes")]
        );

        let extract_dir = dir.path().join("out");
        std::fs::create_dir(&extract_dir)?;
        for file in archive.tree().collect_files() {
            archive.extract(file, &extract_dir)?;
        }
        assert_eq!(std::fs::read(extract_dir.join("a.txt"))?, b"alpha contents");
        assert_eq!(
            std::fs::read(extract_dir.join("b.nif"))?,
            b"beta contents beta contents beta contents"
        );
        Ok(())
    }

    #[test]
    fn written_archives_are_stable_across_rewrites() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("z.txt");
        std::fs::write(&source, b"same bytes every time")?;

        let first_path = dir.path().join("first.bsa");
        let second_path = dir.path().join("second.bsa");

        let mut archive = Archive::new();
        archive.set_type(ArchiveType::Oblivion);
        let file = archive.create_file("z.txt", &source, false);
        let folder = archive.tree_mut().find_or_insert_path(b"docs".as_bstr());
        archive.tree_mut().add_file(folder, file);
        archive.write(&first_path)?;

        // a second read-back and write must reproduce the same bytes
        let mut reread = Archive::new();
        reread.read(&first_path, true)?;
        reread.write(&second_path)?;
        assert_eq!(std::fs::read(&first_path)?, std::fs::read(&second_path)?);
        Ok(())
    }

    #[test]
    fn write_sorts_folders_and_files_by_hash() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("payload.bin");
        std::fs::write(&source, b"x")?;

        let out_path = dir.path().join("sorted.bsa");
        let mut archive = Archive::new();
        archive.set_type(ArchiveType::Oblivion);
        for folder_name in ["zebra", "alpha", "middle"] {
            let folder = archive
                .tree_mut()
                .find_or_insert_path(folder_name.as_bytes().as_bstr());
            for file_name in ["z.txt", "a.txt"] {
                let file = archive.create_file(file_name, &source, false);
                archive.tree_mut().add_file(folder, file);
            }
        }
        archive.write(&out_path)?;

        let mut reread = Archive::new();
        reread.read(&out_path, true)?;
        let tree = reread.tree();
        let folder_hashes: Vec<u64> = tree
            .collect_folders()
            .iter()
            .map(|&id| tree.folder(id).name_hash())
            .collect();
        let mut sorted = folder_hashes.clone();
        sorted.sort_unstable();
        assert_eq!(folder_hashes, sorted);

        for &folder in &tree.collect_folders() {
            let file_hashes: Vec<u64> = tree
                .folder(folder)
                .files()
                .iter()
                .map(|&file| tree.file(file).name_hash())
                .collect();
            let mut sorted = file_hashes.clone();
            sorted.sort_unstable();
            assert_eq!(file_hashes, sorted);
        }
        Ok(())
    }

    #[test]
    fn write_rejects_unwritable_families() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut archive = Archive::new();
        archive.set_type(ArchiveType::Fallout4);
        match archive.write(dir.path().join("nope.ba2")) {
            Err(Error::InvalidType(0x01)) => {}
            other => anyhow::bail!("expected InvalidType, got {other:?}"),
        }

        archive.set_type(ArchiveType::Morrowind);
        assert!(matches!(
            archive.write(dir.path().join("nope.bsa")),
            Err(Error::InvalidType(0x100))
        ));
        Ok(())
    }

    #[test]
    fn write_reports_missing_source_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut archive = Archive::new();
        archive.set_type(ArchiveType::Oblivion);
        let missing = dir.path().join("not_here.txt");
        let file = archive.create_file("not_here.txt", &missing, false);
        let folder = archive.tree_mut().find_or_insert_path(b"docs".as_bstr());
        archive.tree_mut().add_file(folder, file);

        match archive.write(dir.path().join("out.bsa")) {
            Err(Error::SourceFileMissing(path)) => {
                assert_eq!(path, missing);
                Ok(())
            }
            other => anyhow::bail!("expected SourceFileMissing, got {other:?}"),
        }
    }
}
