use crate::{
    archive::{archive_not_open, Archive, ArchiveType},
    compression, dds,
    file::{FileId, Texture},
    Error, Result,
};
use bstr::{BStr, ByteSlice as _};
use crossbeam_channel::bounded;
use std::{
    fs,
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    thread,
    time::Duration,
};

const QUEUE_CAPACITY: usize = 100;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Everything the pipeline threads need to know about one file, snapshotted
/// off the tree so extraction never touches it.
pub(crate) struct FileJob {
    pub name: String,
    pub relative_path: PathBuf,
    pub data_offset: u64,
    pub file_size: u32,
    pub uncompressed_size: u32,
    pub compressed: bool,
    pub texture: Option<Texture>,
    pub source_path: Option<PathBuf>,
}

/// A raw payload produced by the reader side.
pub(crate) struct Payload {
    pub data: Vec<u8>,
    /// The decompressed length when the reader learned it (from the record,
    /// or from the inline size prefix of compressed SkyrimSE payloads).
    pub uncompressed_len: u32,
    /// Texture chunks are decompressed while reading; `data` is then the
    /// finished image and only the DDS envelope is still missing.
    pub assembled: bool,
}

fn relative_output_path(path: &BStr) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.split(|&b| b == b'\\' || b == b'/') {
        if !component.is_empty() {
            out.push(component.to_str_lossy().as_ref());
        }
    }
    out
}

impl Archive {
    pub(crate) fn file_job(&self, id: FileId, full_path: bool) -> FileJob {
        let record = self.tree.file(id);
        let name = record.name().to_str_lossy().into_owned();
        let relative_path = if full_path {
            relative_output_path(self.tree.file_path(id).as_ref())
        } else {
            relative_output_path(record.name())
        };
        FileJob {
            name,
            relative_path,
            data_offset: record.data_offset(),
            file_size: record.size(),
            uncompressed_size: record.uncompressed_size(),
            compressed: self.compressed(id),
            texture: record.texture.clone(),
            source_path: record.source_path().map(Path::to_path_buf),
        }
    }

    /// Extracts every file into `output_directory` through a two-thread
    /// pipeline: a reader that walks the archive in payload order and a
    /// writer that decompresses and emits, joined by a bounded channel.
    ///
    /// `progress` is polled roughly every 100 ms with a percentage and the
    /// name of the file most recently completed; returning `false` requests
    /// cooperative cancellation, which reports [`Error::Canceled`]. Partial
    /// output may exist after cancellation.
    pub fn extract_all<P, F>(&mut self, output_directory: P, mut progress: F, overwrite: bool) -> Result<()>
    where
        P: AsRef<Path>,
        F: FnMut(u32, &str) -> bool,
    {
        let output_directory = output_directory.as_ref();
        fs::create_dir_all(output_directory).map_err(Error::AccessFailed)?;
        for folder in self.tree.collect_folders() {
            let path = output_directory.join(relative_output_path(self.tree.full_path(folder).as_ref()));
            fs::create_dir_all(path).map_err(Error::AccessFailed)?;
        }

        let jobs: Vec<FileJob> = {
            let mut ids = self.tree.collect_files();
            // staged records have no payload in this archive
            ids.retain(|&id| self.tree.file(id).source_path().is_none());
            let mut jobs: Vec<FileJob> = ids.iter().map(|&id| self.file_job(id, true)).collect();
            // ascending offsets keep the reader's disk access sequential
            jobs.sort_by_key(|job| job.data_offset);
            jobs
        };
        let total = jobs.len();
        if total == 0 {
            progress(100, "");
            return Ok(());
        }

        let archive_type = self.archive_type();
        let name_prefixed = self.name_prefixed();
        let stream = self.file.as_mut().ok_or_else(archive_not_open)?;

        let cancel = AtomicBool::new(false);
        let files_done = AtomicUsize::new(0);
        let (sender, receiver) = bounded::<(usize, Payload)>(QUEUE_CAPACITY);

        let canceled = thread::scope(|scope| {
            let jobs = &jobs;
            let cancel = &cancel;
            let files_done = &files_done;

            let reader = scope.spawn(move || {
                for (index, job) in jobs.iter().enumerate() {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    match read_payload(stream, archive_type, name_prefixed, job) {
                        Ok(payload) => {
                            // a send fails only once the extractor is gone
                            if sender.send((index, payload)).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            tracing::warn!(file = %job.name, "skipping unreadable file: {err}");
                        }
                    }
                }
            });

            let extractor = scope.spawn(move || {
                for (index, payload) in receiver {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    let job = &jobs[index];
                    files_done.fetch_add(1, Ordering::Relaxed);

                    let path = output_directory.join(&job.relative_path);
                    if !overwrite && path.exists() {
                        continue;
                    }
                    let mut out = match fs::File::create(&path) {
                        Ok(out) => out,
                        Err(err) => {
                            tracing::warn!(file = %job.name, "failed to create output file: {err}");
                            continue;
                        }
                    };
                    if let Err(err) = write_payload(&mut out, archive_type, job, &payload) {
                        tracing::warn!(file = %job.name, "failed to extract file: {err}");
                    }
                }
            });

            let mut canceled = false;
            loop {
                let finished = reader.is_finished() && extractor.is_finished();
                if !finished {
                    thread::sleep(POLL_INTERVAL);
                }
                let done = files_done.load(Ordering::Relaxed);
                let current = &jobs[done.min(total - 1)].name;
                let percent = (done * 100 / total) as u32;
                if !progress(percent, current) && !canceled {
                    cancel.store(true, Ordering::Relaxed);
                    canceled = true;
                }
                if finished {
                    break;
                }
            }
            canceled
        });

        if canceled {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }
}

/// Reads one file's raw payload at its stored offset, applying the
/// type-specific framing rules: name prefixes are stripped, compressed
/// SkyrimSE payloads give up their inline size prefix, and texture chunks are
/// decompressed into one contiguous buffer.
pub(crate) fn read_payload(
    stream: &mut fs::File,
    archive_type: ArchiveType,
    name_prefixed: bool,
    job: &FileJob,
) -> Result<Payload> {
    if let Some(source_path) = &job.source_path {
        let data =
            fs::read(source_path).map_err(|_| Error::SourceFileMissing(source_path.clone()))?;
        return Ok(Payload {
            uncompressed_len: data.len() as u32,
            data,
            assembled: true,
        });
    }

    if archive_type.is_ba2() {
        if let Some(texture) = &job.texture {
            let total: usize = texture
                .chunks
                .iter()
                .map(|chunk| chunk.unpacked_size as usize)
                .sum();
            let mut data = Vec::with_capacity(total);
            for chunk in &texture.chunks {
                stream.seek(SeekFrom::Start(chunk.offset))?;
                let unpacked_size = chunk.unpacked_size as usize;
                if chunk.packed_size > 0 {
                    let mut packed = vec![0u8; chunk.packed_size as usize];
                    stream.read_exact(&mut packed)?;
                    let unpacked = if archive_type == ArchiveType::StarfieldLz4Texture {
                        compression::lz4_block_decompress(&packed, unpacked_size)
                    } else {
                        compression::zlib_decompress(&packed, unpacked_size)
                    };
                    match unpacked {
                        Ok(unpacked) => data.extend(unpacked),
                        Err(err) => {
                            // keep the image layout intact, blank the chunk
                            tracing::warn!(file = %job.name, "skipping bad texture chunk: {err}");
                            data.resize(data.len() + unpacked_size, 0);
                        }
                    }
                } else {
                    let start = data.len();
                    data.resize(start + unpacked_size, 0);
                    stream.read_exact(&mut data[start..])?;
                }
            }
            return Ok(Payload {
                uncompressed_len: total as u32,
                data,
                assembled: true,
            });
        }

        let size = if job.file_size > 0 {
            job.file_size
        } else {
            job.uncompressed_size
        };
        stream.seek(SeekFrom::Start(job.data_offset))?;
        let mut data = vec![0u8; size as usize];
        stream.read_exact(&mut data)?;
        return Ok(Payload {
            uncompressed_len: job.uncompressed_size,
            data,
            assembled: false,
        });
    }

    stream.seek(SeekFrom::Start(job.data_offset))?;
    let mut size = job.file_size as usize;
    if size == 0 {
        return Ok(Payload {
            data: Vec::new(),
            uncompressed_len: 0,
            assembled: false,
        });
    }

    if name_prefixed {
        let mut prefix_len = [0u8; 1];
        stream.read_exact(&mut prefix_len)?;
        let prefix_len = usize::from(prefix_len[0]);
        let mut prefix = vec![0u8; prefix_len];
        stream.read_exact(&mut prefix)?;
        if size <= prefix_len {
            return Err(Error::InvalidData(io::Error::new(
                io::ErrorKind::InvalidData,
                "name prefix is longer than the stored payload",
            )));
        }
        size -= prefix_len + 1;
    }

    let mut uncompressed_len = 0u32;
    if archive_type == ArchiveType::SkyrimSe && job.compressed {
        if size < 4 {
            return Err(Error::InvalidData(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "compressed payload is missing its size prefix",
            )));
        }
        let mut prefix = [0u8; 4];
        stream.read_exact(&mut prefix)?;
        uncompressed_len = u32::from_le_bytes(prefix);
        size -= 4;
    }

    let mut data = vec![0u8; size];
    stream.read_exact(&mut data)?;
    Ok(Payload {
        data,
        uncompressed_len,
        assembled: false,
    })
}

/// Decompresses a payload with the backend its archive type calls for and
/// writes it out, prepending the DDS envelope for texture files.
pub(crate) fn write_payload<W>(
    out: &mut W,
    archive_type: ArchiveType,
    job: &FileJob,
    payload: &Payload,
) -> Result<()>
where
    W: ?Sized + Write,
{
    if let Some(texture) = &job.texture {
        let (header, dx10) = dds::synthesize(&texture.header)?;
        dds::write_envelope(out, &header, dx10.as_ref())?;
        out.write_all(&payload.data)?;
        return Ok(());
    }

    if payload.assembled {
        out.write_all(&payload.data)?;
        return Ok(());
    }

    if archive_type.is_ba2() {
        if job.file_size > 0 {
            let unpacked =
                compression::zlib_decompress(&payload.data, payload.uncompressed_len as usize)?;
            out.write_all(&unpacked)?;
        } else {
            out.write_all(&payload.data)?;
        }
        return Ok(());
    }

    if job.compressed && !payload.data.is_empty() {
        let unpacked = if archive_type == ArchiveType::SkyrimSe {
            compression::lz4f_decompress(&payload.data, payload.uncompressed_len as usize)?
        } else {
            compression::zlib_decompress_prefixed(&payload.data)?
        };
        out.write_all(&unpacked)?;
    } else {
        out.write_all(&payload.data)?;
    }
    Ok(())
}
