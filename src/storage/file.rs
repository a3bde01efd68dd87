// This file is part of stratumdb.
//
// Copyright (C) 2025 Matheus Cardoso <varvedb@matheus.sbs>
//
// This Source Code Form is subject to the terms of the Mozilla Public License
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at http://mozilla.org/MPL/2.0/.

//! The file driver (§4.5): a single append-only `stream.bin` file, used for local development
//! and as the backing store for the read-cache driver (§4.6).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::codec::{self, RawEvent};
use crate::constants::{MAX_EVENT_FOOTPRINT, STREAM_FILE_NAME};
use crate::error::Result;
use crate::storage::{Driver, ReadOutcome, WriteOutcome};

pub struct FileDriver {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl FileDriver {
    /// Opens (creating if necessary) `<dir>/stream.bin`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(STREAM_FILE_NAME);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Driver for FileDriver {
    async fn get_position(&self) -> Result<i64> {
        let file = self.file.lock().await;
        Ok(file.metadata().await?.len() as i64)
    }

    async fn write(&self, position: i64, events: &[RawEvent]) -> Result<WriteOutcome> {
        let mut file = self.file.lock().await;
        let current_len = file.metadata().await?.len() as i64;
        if current_len != position {
            return Ok(WriteOutcome {
                next_position: current_len,
                success: false,
            });
        }

        let mut payload = Vec::new();
        for event in events {
            codec::write(&mut payload, event)?;
        }
        if !payload.is_empty() {
            file.seek(std::io::SeekFrom::End(0)).await?;
            file.write_all(&payload).await?;
            file.flush().await?;
        }
        Ok(WriteOutcome {
            next_position: position + payload.len() as i64,
            success: true,
        })
    }

    async fn read(&self, position: i64, max_len: usize) -> Result<ReadOutcome> {
        let mut file = self.file.lock().await;
        let len = file.metadata().await?.len() as i64;
        if position >= len {
            return Ok(ReadOutcome {
                next_position: position,
                events: Vec::new(),
            });
        }
        let size = (max_len as i64).min(len - position) as usize;
        let mut buf = vec![0u8; size];
        file.seek(std::io::SeekFrom::Start(position as u64)).await?;
        file.read_exact(&mut buf).await?;
        let buf = Bytes::from(buf);

        let mut events = Vec::new();
        let mut consumed = 0usize;
        loop {
            let window = buf.slice(consumed..);
            match codec::try_parse(&window)? {
                Some((event, n)) => {
                    events.push(event);
                    consumed += n;
                }
                None => break,
            }
        }
        Ok(ReadOutcome {
            next_position: position + consumed as i64,
            events,
        })
    }

    async fn get_last_key(&self) -> Result<u32> {
        let mut file = self.file.lock().await;
        let len = file.metadata().await?.len();
        if len == 0 {
            return Ok(0);
        }
        let tail_len = len.min(MAX_EVENT_FOOTPRINT as u64);
        let mut buf = vec![0u8; tail_len as usize];
        file.seek(std::io::SeekFrom::Start(len - tail_len)).await?;
        file.read_exact(&mut buf).await?;
        codec::last_sequence_from_tail(&buf)
    }

    async fn seek(&self, _key: u32, floor_position: i64) -> Result<i64> {
        Ok(floor_position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(sequence: u32, words: u16) -> RawEvent {
        let payload = vec![0x11; words as usize * 8];
        RawEvent::new(sequence, payload).unwrap()
    }

    #[tokio::test]
    async fn round_trip_and_position_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let d = FileDriver::open(dir.path()).await.unwrap();
        assert_eq!(d.get_position().await.unwrap(), 0);

        let e = event(5, 3);
        let outcome = d.write(0, std::slice::from_ref(&e)).await.unwrap();
        assert!(outcome.success);
        assert_eq!(d.get_position().await.unwrap(), outcome.next_position);

        let read = d.read(0, 4096).await.unwrap();
        assert_eq!(read.events, vec![e]);
        assert_eq!(d.get_last_key().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn write_at_stale_position_fails() {
        let dir = tempfile::tempdir().unwrap();
        let d = FileDriver::open(dir.path()).await.unwrap();
        let e = event(1, 1);
        d.write(0, std::slice::from_ref(&e)).await.unwrap();

        let stale = d.write(0, std::slice::from_ref(&e)).await.unwrap();
        assert!(!stale.success);
        assert_eq!(stale.next_position, 20);
    }

    #[tokio::test]
    async fn reopening_preserves_contents() {
        let dir = tempfile::tempdir().unwrap();
        {
            let d = FileDriver::open(dir.path()).await.unwrap();
            d.write(0, &[event(1, 1)]).await.unwrap();
        }
        let d = FileDriver::open(dir.path()).await.unwrap();
        assert_eq!(d.get_last_key().await.unwrap(), 1);
    }
}
