/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{
    fs::{self, File},
    io::{self, Cursor, Read, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// A re-openable byte source holding a captured message body.
///
/// `open` returns a fresh reader positioned at 0 each time; concurrent
/// readers are not required. `remove` releases the backing storage and is
/// idempotent.
pub trait Buffer: Send + Sync {
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;
    fn len(&self) -> Option<u64>;
    fn remove(&self) -> io::Result<()>;
}

pub struct MemoryBuffer {
    data: Arc<Vec<u8>>,
}

impl MemoryBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        MemoryBuffer {
            data: Arc::new(data),
        }
    }
}

impl Buffer for MemoryBuffer {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(ArcBytes(self.data.clone()))))
    }

    fn len(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn remove(&self) -> io::Result<()> {
        Ok(())
    }
}

struct ArcBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for ArcBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

pub struct FileBuffer {
    path: PathBuf,
    len: Option<u64>,
    removed: AtomicBool,
}

impl FileBuffer {
    /// Wraps an existing file, e.g. a spooled queue body.
    pub fn open_existing(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let len = fs::metadata(&path)?.len();
        Ok(FileBuffer {
            path,
            len: Some(len),
            removed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Buffer for FileBuffer {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(&self.path)?))
    }

    fn len(&self) -> Option<u64> {
        self.len
    }

    fn remove(&self) -> io::Result<()> {
        if !self.removed.swap(true, Ordering::SeqCst) {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Body capture mode, selected at configuration time.
#[derive(Debug, Clone)]
pub enum BufferConfig {
    /// Always keep the body in memory.
    Ram,
    /// Always spill the body to a unique file under the directory.
    Fs(PathBuf),
    /// Keep up to `max_memory` bytes in memory, spill the rest to disk with
    /// the already-read prefix written first.
    Auto { max_memory: usize, dir: PathBuf },
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig::Auto {
            max_memory: 1024 * 1024,
            dir: std::env::temp_dir(),
        }
    }
}

impl BufferConfig {
    pub fn writer(&self) -> BufferWriter {
        BufferWriter {
            config: self.clone(),
            memory: Vec::new(),
            file: None,
        }
    }

    /// Captures an entire reader through a fresh writer.
    pub fn store(&self, reader: &mut dyn Read) -> io::Result<Arc<dyn Buffer>> {
        let mut writer = self.writer();
        let mut chunk = [0u8; 8192];
        loop {
            let n = reader.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            writer.write_chunk(&chunk[..n])?;
        }
        writer.finish()
    }
}

/// Incremental writer producing a [`Buffer`] once the body is complete.
pub struct BufferWriter {
    config: BufferConfig,
    memory: Vec<u8>,
    file: Option<(File, PathBuf)>,
}

impl BufferWriter {
    pub fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        if let Some((file, _)) = &mut self.file {
            return file.write_all(chunk);
        }
        match &self.config {
            BufferConfig::Ram => {
                self.memory.extend_from_slice(chunk);
                Ok(())
            }
            BufferConfig::Fs(dir) => {
                let (mut file, path) = create_unique(dir)?;
                file.write_all(chunk)?;
                self.file = Some((file, path));
                Ok(())
            }
            BufferConfig::Auto { max_memory, dir } => {
                if self.memory.len() + chunk.len() <= *max_memory {
                    self.memory.extend_from_slice(chunk);
                    Ok(())
                } else {
                    let (mut file, path) = create_unique(dir)?;
                    file.write_all(&self.memory)?;
                    file.write_all(chunk)?;
                    self.memory = Vec::new();
                    self.file = Some((file, path));
                    Ok(())
                }
            }
        }
    }

    pub fn finish(self) -> io::Result<Arc<dyn Buffer>> {
        match self.file {
            Some((file, path)) => {
                file.sync_all()?;
                drop(file);
                Ok(Arc::new(FileBuffer::open_existing(path)?))
            }
            None => Ok(Arc::new(MemoryBuffer::new(self.memory))),
        }
    }

    /// Drops whatever was captured so far, deleting any spill file.
    pub fn discard(self) {
        if let Some((file, path)) = self.file {
            drop(file);
            let _ = fs::remove_file(path);
        }
    }
}

fn create_unique(dir: &Path) -> io::Result<(File, PathBuf)> {
    loop {
        let path = dir.join(format!("{:016x}.buf", rand::random::<u64>()));
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => return Ok((file, path)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
}
