/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use common::{
    buffer::{Buffer, FileBuffer},
    error::{Error, Result},
};

use super::QueueMetadata;

/// On-disk spool holding three files per queued message: `<id>.header`,
/// `<id>.body` and `<id>.meta`.
///
/// Writes are ordered header, body, meta, with the meta renamed into place
/// from `<id>.meta.new`; a `.meta` on disk therefore implies a complete
/// message. The directory is single-process; concurrent spools over the same
/// directory are undefined.
pub struct Spool {
    dir: PathBuf,
}

impl Spool {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|err| Error::QueuePersistence(format!("creating {}: {err}", dir.display())))?;
        Ok(Spool { dir })
    }

    fn path(&self, id: &str, suffix: &str) -> PathBuf {
        self.dir.join(format!("{id}.{suffix}"))
    }

    /// Persists a newly committed message. On failure, everything written
    /// so far is cleaned up so no partial message remains visible.
    pub fn store(&self, meta: &QueueMetadata, header: &[u8], body: &dyn Buffer) -> Result<()> {
        let id = meta.msg_meta.id.as_str();
        let result = self.store_inner(id, meta, header, body);
        if result.is_err() {
            let _ = fs::remove_file(self.path(id, "header"));
            let _ = fs::remove_file(self.path(id, "body"));
            let _ = fs::remove_file(self.path(id, "meta.new"));
        }
        result
    }

    fn store_inner(
        &self,
        id: &str,
        meta: &QueueMetadata,
        header: &[u8],
        body: &dyn Buffer,
    ) -> Result<()> {
        write_file(&self.path(id, "header"), header)
            .map_err(|err| Error::QueuePersistence(format!("writing {id}.header: {err}")))?;

        let mut body_file = File::create(self.path(id, "body"))
            .map_err(|err| Error::QueuePersistence(format!("creating {id}.body: {err}")))?;
        let mut reader = body
            .open()
            .map_err(|err| Error::QueuePersistence(format!("opening body of {id}: {err}")))?;
        io::copy(&mut reader, &mut body_file)
            .map_err(|err| Error::QueuePersistence(format!("writing {id}.body: {err}")))?;
        body_file
            .sync_all()
            .map_err(|err| Error::QueuePersistence(format!("syncing {id}.body: {err}")))?;

        self.write_meta(id, meta)
    }

    /// Rewrites `<id>.meta` after an attempt, via the same rename dance.
    pub fn update_meta(&self, meta: &QueueMetadata) -> Result<()> {
        self.write_meta(meta.msg_meta.id.as_str(), meta)
    }

    fn write_meta(&self, id: &str, meta: &QueueMetadata) -> Result<()> {
        let serialized = serde_json::to_vec_pretty(meta)
            .map_err(|err| Error::QueuePersistence(format!("serializing {id}.meta: {err}")))?;
        let tmp = self.path(id, "meta.new");
        write_file(&tmp, &serialized)
            .map_err(|err| Error::QueuePersistence(format!("writing {id}.meta.new: {err}")))?;
        fs::rename(&tmp, self.path(id, "meta"))
            .map_err(|err| Error::QueuePersistence(format!("renaming {id}.meta.new: {err}")))
    }

    pub fn load(&self, id: &str) -> Result<(QueueMetadata, Vec<u8>, Arc<dyn Buffer>)> {
        let meta_raw = fs::read(self.path(id, "meta"))
            .map_err(|err| Error::QueuePersistence(format!("reading {id}.meta: {err}")))?;
        let meta: QueueMetadata = serde_json::from_slice(&meta_raw)
            .map_err(|err| Error::QueuePersistence(format!("parsing {id}.meta: {err}")))?;
        let header = fs::read(self.path(id, "header"))
            .map_err(|err| Error::QueuePersistence(format!("reading {id}.header: {err}")))?;
        let body = FileBuffer::open_existing(self.path(id, "body"))
            .map_err(|err| Error::QueuePersistence(format!("opening {id}.body: {err}")))?;
        Ok((meta, header, Arc::new(body)))
    }

    /// Removes all files of a finished message. Meta goes first so a crash
    /// mid-removal leaves only orphans for the startup sweep.
    pub fn remove(&self, id: &str) {
        for suffix in ["meta", "header", "body"] {
            let _ = fs::remove_file(self.path(id, suffix));
        }
    }

    /// Sidelines a message whose dispatch panicked so it is not picked up
    /// again; the data files stay for manual inspection.
    pub fn mark_broken(&self, id: &str) {
        let _ = fs::rename(self.path(id, "meta"), self.path(id, "meta_broken"));
    }

    /// Startup sweep: parses every `.meta`, removes dangling `.header` and
    /// `.body` files with no metadata, and reports sidelined messages.
    pub fn scan(&self) -> Result<Vec<QueueMetadata>> {
        let mut metas = Vec::new();
        let mut data_files: Vec<(String, PathBuf)> = Vec::new();
        let mut known: Vec<String> = Vec::new();

        let entries = fs::read_dir(&self.dir).map_err(|err| {
            Error::QueuePersistence(format!("listing {}: {err}", self.dir.display()))
        })?;
        for entry in entries {
            let entry = entry.map_err(|err| {
                Error::QueuePersistence(format!("listing {}: {err}", self.dir.display()))
            })?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(id) = name.strip_suffix(".meta") {
                match self.load(id) {
                    Ok((meta, _, _)) => {
                        known.push(id.to_string());
                        metas.push(meta);
                    }
                    Err(err) => {
                        tracing::error!(
                            context = "queue",
                            event = "scan-failed",
                            id = id,
                            reason = %err,
                            "unreadable queue entry sidelined"
                        );
                        self.mark_broken(id);
                    }
                }
            } else if let Some(id) = name.strip_suffix(".meta_broken") {
                tracing::warn!(
                    context = "queue",
                    event = "broken-entry",
                    id = id,
                    "sidelined message awaiting manual recovery"
                );
                known.push(id.to_string());
            } else if let Some(id) = name
                .strip_suffix(".header")
                .or_else(|| name.strip_suffix(".body"))
                .or_else(|| name.strip_suffix(".meta.new"))
            {
                data_files.push((id.to_string(), path));
            }
        }

        for (id, path) in data_files {
            if !known.contains(&id) {
                tracing::warn!(
                    context = "queue",
                    event = "orphan-reaped",
                    id = id.as_str(),
                    file = %path.display(),
                    "dangling spool file without metadata"
                );
                let _ = fs::remove_file(path);
            }
        }

        Ok(metas)
    }
}

fn write_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()
}
