use crate::{
    file::{FileId, FileRecord},
    hashing,
};
use bstr::{BStr, BString, ByteSlice as _};
use std::collections::HashMap;

/// A handle to a folder in an [`Archive`](crate::Archive)'s folder tree.
///
/// Handles stay valid for the lifetime of the tree that produced them;
/// re-reading an archive invalidates previously obtained handles.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FolderId(pub(crate) u32);

/// One node of the folder hierarchy.
#[derive(Debug, Default)]
pub struct Folder {
    pub(crate) name: BString,
    pub(crate) parent: Option<FolderId>,
    pub(crate) subfolders: Vec<FolderId>,
    pub(crate) subfolders_by_name: HashMap<BString, FolderId>,
    pub(crate) files: Vec<FileId>,
    pub(crate) name_hash: u64,
    /// Where this folder's file records begin in the source archive.
    pub(crate) offset: u64,
    /// The offset recorded for this folder during the first writer pass.
    pub(crate) write_offset: u64,
}

impl Folder {
    /// The folder's own path component. Empty for the root.
    #[must_use]
    pub fn name(&self) -> &BStr {
        self.name.as_ref()
    }

    #[must_use]
    pub fn name_hash(&self) -> u64 {
        self.name_hash
    }

    #[must_use]
    pub fn parent(&self) -> Option<FolderId> {
        self.parent
    }

    /// Child folders, in insertion order.
    #[must_use]
    pub fn subfolders(&self) -> &[FolderId] {
        &self.subfolders
    }

    /// Files directly inside this folder, in insertion order.
    #[must_use]
    pub fn files(&self) -> &[FileId] {
        &self.files
    }
}

/// The in-memory folder hierarchy of an archive.
///
/// Nodes live in an arena indexed by [`FolderId`]/[`FileId`]; parent links
/// are plain back-indices, so the tree drops without any unwinding order
/// concerns.
#[derive(Debug)]
pub struct FolderTree {
    folders: Vec<Folder>,
    files: Vec<FileRecord>,
}

impl Default for FolderTree {
    fn default() -> Self {
        Self::new()
    }
}

impl FolderTree {
    #[must_use]
    pub fn new() -> Self {
        Self {
            folders: vec![Folder::default()],
            files: Vec::new(),
        }
    }

    /// The root folder: empty name, no parent.
    #[must_use]
    pub fn root(&self) -> FolderId {
        FolderId(0)
    }

    #[must_use]
    pub fn folder(&self, id: FolderId) -> &Folder {
        &self.folders[id.0 as usize]
    }

    pub(crate) fn folder_mut(&mut self, id: FolderId) -> &mut Folder {
        &mut self.folders[id.0 as usize]
    }

    #[must_use]
    pub fn file(&self, id: FileId) -> &FileRecord {
        &self.files[id.0 as usize]
    }

    pub(crate) fn file_mut(&mut self, id: FileId) -> &mut FileRecord {
        &mut self.files[id.0 as usize]
    }

    /// Adds a new direct child folder, or returns the existing one with the
    /// same name.
    pub fn add_folder(&mut self, parent: FolderId, name: &BStr) -> FolderId {
        if let Some(&existing) = self.folder(parent).subfolders_by_name.get(name) {
            return existing;
        }

        let full_path = {
            let mut path = self.full_path(parent);
            if !path.is_empty() {
                path.push(b'\\');
            }
            path.extend_from_slice(name);
            path
        };
        let id = FolderId(self.folders.len() as u32);
        self.folders.push(Folder {
            name: name.to_owned(),
            parent: Some(parent),
            name_hash: hashing::hash_path(full_path.as_ref()),
            ..Folder::default()
        });
        let parent = self.folder_mut(parent);
        parent.subfolders.push(id);
        parent.subfolders_by_name.insert(name.to_owned(), id);
        id
    }

    /// Walks a folder path from the root, creating missing components, and
    /// returns the final folder. Components are split on both `\` and `/`;
    /// empty components are skipped. Inserting the same path twice yields the
    /// same handle.
    pub fn find_or_insert_path(&mut self, path: &BStr) -> FolderId {
        let mut current = self.root();
        for component in path.split(|&b| b == b'\\' || b == b'/') {
            if component.is_empty() {
                continue;
            }
            current = self.add_folder(current, component.as_bstr());
        }
        current
    }

    /// Appends a file to a folder and returns its handle.
    pub fn add_file(&mut self, folder: FolderId, mut record: FileRecord) -> FileId {
        record.folder = Some(folder);
        let id = FileId(self.files.len() as u32);
        self.files.push(record);
        self.folder_mut(folder).files.push(id);
        id
    }

    /// The folder's full path with `\` separators; empty for the root.
    #[must_use]
    pub fn full_path(&self, id: FolderId) -> BString {
        let mut components = Vec::new();
        let mut current = Some(id);
        while let Some(id) = current {
            let folder = self.folder(id);
            if folder.parent.is_some() {
                components.push(folder.name.as_slice());
            }
            current = folder.parent;
        }

        let mut path = BString::default();
        for component in components.iter().rev() {
            if !path.is_empty() {
                path.push(b'\\');
            }
            path.extend_from_slice(component);
        }
        path
    }

    /// The file's full path within the archive.
    #[must_use]
    pub fn file_path(&self, id: FileId) -> BString {
        let record = self.file(id);
        let mut path = record
            .folder
            .map(|folder| self.full_path(folder))
            .unwrap_or_default();
        if !path.is_empty() {
            path.push(b'\\');
        }
        path.extend_from_slice(&record.name);
        path
    }

    /// Collects every folder that directly contains at least one file, in
    /// depth-first pre-order. Empty folders and the root are not part of the
    /// write path's folder table and are skipped.
    #[must_use]
    pub fn collect_folders(&self) -> Vec<FolderId> {
        let mut out = Vec::new();
        self.collect_folders_into(self.root(), &mut out);
        out
    }

    fn collect_folders_into(&self, id: FolderId, out: &mut Vec<FolderId>) {
        for &subfolder in &self.folder(id).subfolders {
            if !self.folder(subfolder).files.is_empty() {
                out.push(subfolder);
            }
            self.collect_folders_into(subfolder, out);
        }
    }

    /// Collects every file in the tree: a folder's own files first, then its
    /// subfolders, depth-first.
    #[must_use]
    pub fn collect_files(&self) -> Vec<FileId> {
        let mut out = Vec::new();
        self.collect_files_into(self.root(), &mut out);
        out
    }

    fn collect_files_into(&self, id: FolderId, out: &mut Vec<FileId>) {
        let folder = self.folder(id);
        out.extend_from_slice(&folder.files);
        for &subfolder in &folder.subfolders {
            self.collect_files_into(subfolder, out);
        }
    }

    /// Full paths of the populated folders, in [`collect_folders`] order.
    ///
    /// [`collect_folders`]: Self::collect_folders
    #[must_use]
    pub fn collect_folder_names(&self) -> Vec<BString> {
        self.collect_folders()
            .into_iter()
            .map(|id| self.full_path(id))
            .collect()
    }

    /// Basenames of every file, in [`collect_files`] order.
    ///
    /// [`collect_files`]: Self::collect_files
    #[must_use]
    pub fn collect_file_names(&self) -> Vec<BString> {
        self.collect_files()
            .into_iter()
            .map(|id| self.file(id).name.clone())
            .collect()
    }

    #[must_use]
    pub fn count_files(&self) -> usize {
        self.files.len()
    }
}
