// This file is part of stratumdb.
//
// Copyright (C) 2025 Matheus Cardoso <varvedb@matheus.sbs>
//
// This Source Code Form is subject to the terms of the Mozilla Public License
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at http://mozilla.org/MPL/2.0/.

//! The narrow append-blob contract the multi-blob and mono-blob drivers are built against
//! (§4.3). Factoring this out of the drivers themselves is what makes §8 scenario S4 ("shard
//! rollover") and the `Collision`/`MaxReached` distinction testable without a real object store:
//! tests drive the drivers over `FakeBlobBackend`, production wires up `AzureBlobBackend`.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};

/// One listed blob and its current length.
#[derive(Debug, Clone)]
pub struct BlobMeta {
    pub name: String,
    pub length: u64,
}

/// The two distinguishable failure modes `append` can report, per §4.3/§7: an optimistic
/// conflict (someone else appended first) and capacity exhaustion (the backend's per-blob
/// block-count cap). Anything else is an opaque backend error.
#[derive(Debug)]
pub enum BlobOpError {
    /// HTTP 412 equivalent: `expected_length` did not match the blob's current length.
    Collision { current_length: u64 },
    /// The blob has reached the backend's maximum block count (50000 appends).
    MaxReached,
    Other(Error),
}

impl From<Error> for BlobOpError {
    fn from(e: Error) -> Self {
        BlobOpError::Other(e)
    }
}

/// An append-blob / block-blob object store, narrowed to exactly what the multi-blob and
/// mono-blob drivers need. All methods are idempotent except `append`, matching §9's
/// "`append_transactional` is never retried" asymmetry — callers wrap every method except
/// `append` in the retry helper.
#[async_trait]
pub trait BlobBackend: Send + Sync {
    /// Lists blobs whose name starts with `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>>;

    /// Creates an empty append blob named `name` unless one already exists (tolerates
    /// `BlobAlreadyExists`).
    async fn create_append_blob_if_not_exists(&self, name: &str) -> Result<()>;

    /// Appends `data` to the append blob `name` iff its current length equals
    /// `expected_length`. Never retried internally by this trait's implementations.
    async fn append(
        &self,
        name: &str,
        data: &[u8],
        expected_length: u64,
    ) -> std::result::Result<(), BlobOpError>;

    /// Reads `len` bytes starting at `offset` from blob `name` (append or block blob).
    async fn read_range(&self, name: &str, offset: u64, len: u64) -> Result<Bytes>;

    /// Current length of blob `name`.
    async fn blob_length(&self, name: &str) -> Result<u64>;

    /// Reads one user-metadata value, if the blob carries it.
    async fn get_metadata(&self, name: &str, key: &str) -> Result<Option<String>>;

    /// Best-effort metadata write; permission errors are tolerated by callers, not here.
    async fn set_metadata(&self, name: &str, key: &str, value: &str) -> Result<()>;

    /// Creates (or overwrites) a block-blob staging area and commits one block to it.
    async fn stage_block(&self, name: &str, block_id: &str, data: &[u8]) -> Result<()>;

    /// Commits the block list for the block blob `name`, making the staged blocks visible.
    async fn commit_block_list(&self, name: &str, block_ids: &[String]) -> Result<()>;
}

#[cfg(feature = "azure-blob")]
mod azure_impl {
    use super::*;
    use azure_storage::prelude::*;
    use azure_storage_blobs::prelude::*;

    /// `BlobBackend` backed by a real Azure Storage container via `azure_storage_blobs`.
    pub struct AzureBlobBackend {
        container: ContainerClient,
    }

    impl AzureBlobBackend {
        pub fn from_connection_string(connection: &str, container_name: &str) -> Result<Self> {
            let client = ClientBuilder::from_connection_string(connection)
                .map_err(azure_core::Error::from)?
                .container_client(container_name);
            Ok(Self { container: client })
        }

        fn blob(&self, name: &str) -> BlobClient {
            self.container.blob_client(name)
        }
    }

    #[async_trait]
    impl BlobBackend for AzureBlobBackend {
        async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>> {
            use futures_util::StreamExt;

            let mut items = Vec::new();
            let mut pages = self
                .container
                .list_blobs()
                .prefix(prefix.to_owned())
                .into_stream();
            while let Some(page) = pages.next().await {
                let page = page?;
                for blob in page.blobs.blobs() {
                    items.push(BlobMeta {
                        name: blob.name.clone(),
                        length: blob.properties.content_length,
                    });
                }
            }
            items.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(items)
        }

        async fn create_append_blob_if_not_exists(&self, name: &str) -> Result<()> {
            match self.blob(name).put_append_blob().await {
                Ok(_) => Ok(()),
                Err(e) if is_already_exists(&e) => Ok(()),
                Err(e) => Err(e.into()),
            }
        }

        async fn append(
            &self,
            name: &str,
            data: &[u8],
            expected_length: u64,
        ) -> std::result::Result<(), BlobOpError> {
            let result = self
                .blob(name)
                .append_block(data.to_vec())
                .condition_max_size(expected_length)
                .await;
            match result {
                Ok(_) => Ok(()),
                Err(e) if is_precondition_failed(&e) => {
                    let current_length = self.blob_length(name).await.unwrap_or(expected_length);
                    Err(BlobOpError::Collision { current_length })
                }
                Err(e) if is_block_count_exceeded(&e) => Err(BlobOpError::MaxReached),
                Err(e) => Err(BlobOpError::Other(e.into())),
            }
        }

        async fn read_range(&self, name: &str, offset: u64, len: u64) -> Result<Bytes> {
            let range = azure_core::request_options::Range::new(offset, offset + len);
            let mut stream = self.blob(name).get().range(range).into_stream();
            let mut out = Vec::with_capacity(len as usize);
            use futures_util::StreamExt;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                let mut body = chunk.data;
                while let Some(piece) = body.next().await {
                    out.extend_from_slice(&piece?);
                }
            }
            Ok(Bytes::from(out))
        }

        async fn blob_length(&self, name: &str) -> Result<u64> {
            let props = self.blob(name).get_properties().await?;
            Ok(props.blob.properties.content_length)
        }

        async fn get_metadata(&self, name: &str, key: &str) -> Result<Option<String>> {
            let props = self.blob(name).get_properties().await?;
            Ok(props.blob.metadata.and_then(|m| m.get(key).cloned()))
        }

        async fn set_metadata(&self, name: &str, key: &str, value: &str) -> Result<()> {
            let mut metadata = Metadata::new();
            metadata.insert(key.to_owned(), value.to_owned());
            self.blob(name).set_metadata(metadata).await?;
            Ok(())
        }

        async fn stage_block(&self, name: &str, block_id: &str, data: &[u8]) -> Result<()> {
            self.blob(name)
                .put_block(block_id.as_bytes().to_vec(), data.to_vec())
                .await?;
            Ok(())
        }

        async fn commit_block_list(&self, name: &str, block_ids: &[String]) -> Result<()> {
            let list = BlockList {
                blocks: block_ids
                    .iter()
                    .map(|id| BlobBlockType::Uncommitted(BlockId::new(id.as_bytes().to_vec())))
                    .collect(),
            };
            self.blob(name).put_block_list(list).await?;
            Ok(())
        }
    }

    fn is_already_exists(e: &azure_core::Error) -> bool {
        matches!(e.kind(), azure_core::error::ErrorKind::HttpResponse { status, .. } if status.as_u16() == 409)
    }

    fn is_precondition_failed(e: &azure_core::Error) -> bool {
        matches!(e.kind(), azure_core::error::ErrorKind::HttpResponse { status, .. } if status.as_u16() == 412)
    }

    fn is_block_count_exceeded(e: &azure_core::Error) -> bool {
        // Azure reports block-count exhaustion as 409 BlockCountExceedsLimit; precondition
        // failures (412) are handled separately above.
        matches!(e.kind(), azure_core::error::ErrorKind::HttpResponse { status, .. } if status.as_u16() == 409)
            && e.to_string().contains("BlockCountExceedsLimit")
    }
}

#[cfg(feature = "azure-blob")]
pub use azure_impl::AzureBlobBackend;
