//! In-memory archive images for tests: minimal but layout-exact renditions
//! of the on-disk formats, built with offsets computed up front.

use crate::{compression, hashing, ArchiveFlags, ArchiveType};
use bstr::ByteSlice as _;
use lzzzz::lz4f::{self, AutoFlush, PreferencesBuilder};

/// A legacy compressed payload: decompressed size, then the zlib stream.
pub(crate) fn zlib_payload(raw: &[u8]) -> Vec<u8> {
    let mut payload = (raw.len() as u32).to_le_bytes().to_vec();
    payload.extend(compression::zlib_compress(raw).expect("zlib compression"));
    payload
}

/// A SkyrimSE compressed payload: decompressed size, then one LZ4 frame.
pub(crate) fn lz4_payload(raw: &[u8]) -> Vec<u8> {
    let prefs = PreferencesBuilder::new()
        .auto_flush(AutoFlush::Enabled)
        .build();
    let mut frame = Vec::new();
    lz4f::compress_to_vec(raw, &mut frame, &prefs).expect("lz4 compression");
    let mut payload = (raw.len() as u32).to_le_bytes().to_vec();
    payload.extend(frame);
    payload
}

fn hash(name: &str) -> u64 {
    hashing::hash_path(name.as_bytes().as_bstr())
}

pub(crate) struct LegacyArchiveBuilder {
    archive_type: ArchiveType,
    flags: ArchiveFlags,
    corrupt_file_hashes: bool,
    folders: Vec<(String, Vec<(String, Vec<u8>)>)>,
}

impl LegacyArchiveBuilder {
    pub(crate) fn new(archive_type: ArchiveType) -> Self {
        Self {
            archive_type,
            flags: ArchiveFlags::default(),
            corrupt_file_hashes: false,
            folders: Vec::new(),
        }
    }

    pub(crate) fn flags(mut self, flags: ArchiveFlags) -> Self {
        self.flags = flags;
        self
    }

    pub(crate) fn corrupt_file_hashes(mut self) -> Self {
        self.corrupt_file_hashes = true;
        self
    }

    /// Adds a folder with files whose payload bytes are stored verbatim.
    pub(crate) fn folder(mut self, name: &str, files: &[(&str, &[u8])]) -> Self {
        self.folders.push((
            name.to_owned(),
            files
                .iter()
                .map(|&(file_name, payload)| (file_name.to_owned(), payload.to_vec()))
                .collect(),
        ));
        self
    }

    pub(crate) fn build(self) -> Vec<u8> {
        let wide = self.archive_type == ArchiveType::SkyrimSe;
        let folder_record_size = if wide { 24 } else { 16 };
        let header_size = 36usize;

        let file_count: usize = self.folders.iter().map(|(_, files)| files.len()).sum();
        let folder_name_length: usize = self.folders.iter().map(|(name, _)| name.len() + 1).sum();
        let file_name_length: usize = self
            .folders
            .iter()
            .flat_map(|(_, files)| files.iter())
            .map(|(name, _)| name.len() + 1)
            .sum();

        // layout: header | folder records | per-folder name+record blocks |
        // file name table | payloads
        let records_end = header_size + folder_record_size * self.folders.len();
        let mut block_offsets = Vec::new();
        let mut position = records_end;
        for (name, files) in &self.folders {
            block_offsets.push(position);
            position += 1 + name.len() + 1 + 16 * files.len();
        }
        let names_end = position + file_name_length;

        let mut payload_offsets: Vec<Vec<usize>> = Vec::new();
        let mut data_position = names_end;
        for (_, files) in &self.folders {
            let mut offsets = Vec::new();
            for (_, payload) in files {
                offsets.push(data_position);
                data_position += payload.len();
            }
            payload_offsets.push(offsets);
        }

        let mut out = Vec::with_capacity(data_position);
        out.extend(b"BSA\0");
        out.extend(self.archive_type.id().to_le_bytes());
        out.extend(0x24u32.to_le_bytes());
        out.extend(self.flags.bits().to_le_bytes());
        out.extend((self.folders.len() as u32).to_le_bytes());
        out.extend((file_count as u32).to_le_bytes());
        out.extend((folder_name_length as u32).to_le_bytes());
        out.extend((file_name_length as u32).to_le_bytes());
        out.extend(0u32.to_le_bytes());

        for ((name, files), block_offset) in self.folders.iter().zip(&block_offsets) {
            out.extend(hash(name).to_le_bytes());
            out.extend((files.len() as u32).to_le_bytes());
            // stored offsets carry the file name table length on top
            let stored = (block_offset + file_name_length) as u64;
            if wide {
                out.extend(0u32.to_le_bytes());
                out.extend(stored.to_le_bytes());
            } else {
                out.extend((stored as u32).to_le_bytes());
            }
        }

        for (folder_index, (name, files)) in self.folders.iter().enumerate() {
            out.push((name.len() + 1) as u8);
            out.extend(name.as_bytes());
            out.push(0);
            for (file_index, (file_name, payload)) in files.iter().enumerate() {
                let mut file_hash = hash(file_name);
                if self.corrupt_file_hashes {
                    file_hash = file_hash.wrapping_add(1);
                }
                out.extend(file_hash.to_le_bytes());
                out.extend((payload.len() as u32).to_le_bytes());
                out.extend((payload_offsets[folder_index][file_index] as u32).to_le_bytes());
            }
        }

        for (_, files) in &self.folders {
            for (file_name, _) in files {
                out.extend(file_name.as_bytes());
                out.push(0);
            }
        }
        for (_, files) in &self.folders {
            for (_, payload) in files {
                out.extend(payload);
            }
        }

        debug_assert_eq!(out.len(), data_position);
        out
    }
}

fn ba2_gnrl_image(files: &[(&str, &[u8], u32, u32)]) -> Vec<u8> {
    let records_end = 24 + 36 * files.len();
    let mut payload_offsets = Vec::new();
    let mut data_position = records_end;
    for &(_, payload, _, _) in files {
        payload_offsets.push(data_position);
        data_position += payload.len();
    }
    let name_table_offset = data_position as u64;

    let mut out = Vec::new();
    out.extend(b"BTDX");
    out.extend(0x01u32.to_le_bytes());
    out.extend(b"GNRL");
    out.extend((files.len() as u32).to_le_bytes());
    out.extend(name_table_offset.to_le_bytes());

    for (&(_, _, packed_size, unpacked_size), &offset) in files.iter().zip(&payload_offsets) {
        out.extend(0u32.to_le_bytes()); // name hash
        out.extend(b"\0\0\0\0"); // extension
        out.extend(0u32.to_le_bytes()); // directory hash
        out.extend(0u32.to_le_bytes());
        out.extend((offset as u64).to_le_bytes());
        out.extend(packed_size.to_le_bytes());
        out.extend(unpacked_size.to_le_bytes());
        out.extend(0u32.to_le_bytes());
    }
    for &(_, payload, _, _) in files {
        out.extend(payload);
    }
    for &(path, _, _, _) in files {
        out.extend((path.len() as u16).to_le_bytes());
        out.extend(path.as_bytes());
    }
    out
}

/// A `GNRL` BA2 whose payloads are stored uncompressed.
pub(crate) fn ba2_gnrl_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let entries: Vec<(&str, &[u8], u32, u32)> = files
        .iter()
        .map(|&(path, payload)| (path, payload, 0, payload.len() as u32))
        .collect();
    ba2_gnrl_image(&entries)
}

/// A `GNRL` BA2 with zlib-deflated payloads; entries carry the raw length.
pub(crate) fn ba2_gnrl_compressed_bytes(files: &[(&str, &[u8], u32)]) -> Vec<u8> {
    let entries: Vec<(&str, &[u8], u32, u32)> = files
        .iter()
        .map(|&(path, payload, unpacked)| (path, payload, payload.len() as u32, unpacked))
        .collect();
    ba2_gnrl_image(&entries)
}

/// A `DX10` BA2 holding one texture with a single stored-uncompressed chunk.
pub(crate) fn ba2_dx10_bytes(
    path: &str,
    width: u16,
    height: u16,
    mip_count: u8,
    format: u16,
    payload: &[u8],
) -> Vec<u8> {
    let data_position = 24 + 24 + 24; // header, texture header, one chunk
    let name_table_offset = (data_position + payload.len()) as u64;

    let mut out = Vec::new();
    out.extend(b"BTDX");
    out.extend(0x01u32.to_le_bytes());
    out.extend(b"DX10");
    out.extend(1u32.to_le_bytes());
    out.extend(name_table_offset.to_le_bytes());

    out.extend(0u32.to_le_bytes()); // name hash
    out.extend(b"dds\0");
    out.extend(0u32.to_le_bytes()); // directory hash
    out.push(0); // unknown1
    out.push(1); // chunk count
    out.extend(24u16.to_le_bytes()); // chunk header size
    out.extend(height.to_le_bytes());
    out.extend(width.to_le_bytes());
    out.push(mip_count);
    out.extend(format.to_le_bytes());
    out.push(0); // unknown2

    out.extend((data_position as u64).to_le_bytes());
    out.extend(0u32.to_le_bytes()); // packed size: stored raw
    out.extend((payload.len() as u32).to_le_bytes());
    out.extend(0u16.to_le_bytes()); // start mip
    out.extend(u16::from(mip_count.saturating_sub(1)).to_le_bytes()); // end mip
    out.extend(0u32.to_le_bytes());

    out.extend(payload);
    out.extend((path.len() as u16).to_le_bytes());
    out.extend(path.as_bytes());
    out
}

/// A Morrowind archive image with its size/offset, name-offset, name, and
/// hash tables.
pub(crate) fn morrowind_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let names_length: usize = files.iter().map(|(name, _)| name.len() + 1).sum();
    let hash_offset = 12 * files.len() + names_length;

    let mut out = Vec::new();
    out.extend(0x100u32.to_le_bytes());
    out.extend((hash_offset as u32).to_le_bytes());
    out.extend((files.len() as u32).to_le_bytes());

    let mut data_offset = 0u32;
    for &(_, payload) in files {
        out.extend((payload.len() as u32).to_le_bytes());
        out.extend(data_offset.to_le_bytes());
        data_offset += payload.len() as u32;
    }

    let mut name_offset = 0u32;
    for &(name, _) in files {
        out.extend(name_offset.to_le_bytes());
        name_offset += name.len() as u32 + 1;
    }
    for &(name, _) in files {
        out.extend(name.as_bytes());
        out.push(0);
    }

    out.extend(std::iter::repeat(0u8).take(8 * files.len())); // hash table
    for &(_, payload) in files {
        out.extend(payload);
    }
    out
}
