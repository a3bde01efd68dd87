// This file is part of stratumdb.
//
// Copyright (C) 2025 Matheus Cardoso <varvedb@matheus.sbs>
//
// This Source Code Form is subject to the terms of the Mozilla Public License
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at http://mozilla.org/MPL/2.0/.

//! The projection cache provider (§4.8): named, last-write-wins binary slots, with
//! priority-ordered read candidates (most recent first) and a single-writer-per-name lock.
//!
//! Simplification from §4.8: the spec has the writer invoke a caller-supplied sink-writing
//! closure under the lock so bytes can stream out without an extra buffer. We instead have the
//! caller (the reified projection) build the complete slot contents in memory first and pass
//! them to `try_write` as a `Vec<u8>` — contention on the per-name lock still behaves exactly as
//! specified ("a second concurrent writer on the same name does not invoke f", read as "does
//! not perform the write"), and a projection state snapshot is small enough that the extra copy
//! is immaterial. Recorded in DESIGN.md.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// One saved snapshot, as read back: `name` is the projection name it belongs to, `contents`
/// the raw slot bytes (`seq_head ‖ state_bytes ‖ seq_tail`, undecoded).
#[derive(Debug, Clone)]
pub struct CacheCandidate {
    pub name: String,
    pub contents: Bytes,
}

#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// Lazily-ordered read candidates, most recent first. Returns an empty list if nothing has
    /// ever been saved for `name`.
    async fn open_read(&self, name: &str) -> Result<Vec<CacheCandidate>>;

    /// Attempts to durably save `contents` as the newest slot for `name`. Returns `Ok(false)`
    /// without touching storage if another writer currently holds `name`'s lock.
    async fn try_write(&self, name: &str, contents: Vec<u8>) -> Result<bool>;
}

/// Directory-of-slots implementation: `<root>/<name>/<version>.slot`, versions are monotonic
/// and zero-padded so lexicographic and numeric order agree.
pub struct FileCacheProvider {
    root: PathBuf,
    writing: Mutex<HashSet<String>>,
}

impl FileCacheProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writing: Mutex::new(HashSet::new()),
        }
    }

    fn dir_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    async fn slot_versions(dir: &Path) -> Result<Vec<u64>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(v) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.strip_suffix(".slot"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                versions.push(v);
            }
        }
        Ok(versions)
    }
}

#[async_trait]
impl CacheProvider for FileCacheProvider {
    async fn open_read(&self, name: &str) -> Result<Vec<CacheCandidate>> {
        let dir = self.dir_for(name);
        let mut versions = Self::slot_versions(&dir).await?;
        versions.sort_unstable_by(|a, b| b.cmp(a));

        let mut candidates = Vec::with_capacity(versions.len());
        for version in versions {
            let path = dir.join(format!("{version:020}.slot"));
            if let Ok(bytes) = tokio::fs::read(&path).await {
                candidates.push(CacheCandidate {
                    name: name.to_owned(),
                    contents: Bytes::from(bytes),
                });
            }
        }
        Ok(candidates)
    }

    async fn try_write(&self, name: &str, contents: Vec<u8>) -> Result<bool> {
        {
            let mut writing = self.writing.lock().expect("cache lock poisoned");
            if !writing.insert(name.to_owned()) {
                return Ok(false);
            }
        }
        let result = self.try_write_locked(name, contents).await;
        self.writing.lock().expect("cache lock poisoned").remove(name);
        result
    }
}

impl FileCacheProvider {
    async fn try_write_locked(&self, name: &str, contents: Vec<u8>) -> Result<bool> {
        let dir = self.dir_for(name);
        tokio::fs::create_dir_all(&dir).await?;
        let next_version = Self::slot_versions(&dir).await?.into_iter().max().map_or(0, |v| v + 1);
        let final_path = dir.join(format!("{next_version:020}.slot"));
        let tmp_path = dir.join(format!("{next_version:020}.slot.tmp"));
        tokio::fs::write(&tmp_path, &contents).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(true)
    }
}
