//! Chunked file transfer: slicing outbound files and reassembling inbound ones.
//!
//! Transfers travel as one `file/info` message followed by `file/chunk`
//! messages in index order. Nothing is retransmitted: an inbound transfer
//! that stops receiving chunks is dropped by the idle check and reported as
//! stalled.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use meshroom_core::{
    FILE_CHUNK_BYTES, FileChunk, FileId, FileInfo, MAX_FILE_BYTES, MAX_INFLIGHT_TRANSFERS,
    MAX_TOTAL_CHUNKS, PeerId, derive_transfer_id, now_unix_ms, total_chunks_for,
};
use thiserror::Error;

use crate::error::SessionError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("no transfer in progress for file {0}")]
    UnknownTransfer(FileId),
    #[error("chunk {index} out of range for file {file_id} ({total} chunks)")]
    ChunkOutOfRange {
        file_id: FileId,
        index: u32,
        total: u32,
    },
    #[error("invalid file info for {file_id}: {reason}")]
    InvalidInfo { file_id: FileId, reason: String },
    #[error("too many concurrent inbound transfers")]
    TooManyTransfers,
    #[error("chunk for {file_id} is not valid base64: {reason}")]
    BadChunk { file_id: FileId, reason: String },
    #[error("file {file_id} reassembled to {actual} bytes, expected {expected}")]
    SizeMismatch {
        file_id: FileId,
        expected: u64,
        actual: u64,
    },
}

/// A fully reassembled inbound file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub file_id: FileId,
    pub sender_id: PeerId,
    pub name: String,
    pub mime: String,
    pub bytes: Bytes,
}

/// What an accepted chunk did to its transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    Collecting { received: u32, total: u32 },
    Complete(ReceivedFile),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleCheck {
    /// The transfer finished or was dropped already.
    Gone,
    /// Chunks arrived since the check was armed; re-arm with this marker.
    Active(u64),
    Stalled(FileInfo),
}

#[derive(Debug)]
struct IncomingTransfer {
    info: FileInfo,
    chunks: Vec<Option<Vec<u8>>>,
    received: u32,
    activity: u64,
}

#[derive(Debug)]
struct OutgoingTransfer {
    info: FileInfo,
    data: Bytes,
    next_index: u32,
}

#[derive(Debug, Default)]
pub struct FileTransferEngine {
    incoming: HashMap<FileId, IncomingTransfer>,
    outgoing: HashMap<FileId, OutgoingTransfer>,
    activity_seq: u64,
}

impl FileTransferEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits an outbound file and returns the `file/info` describing it.
    /// Rejected files leave no state behind.
    pub fn start_outgoing(
        &mut self,
        sender_id: &str,
        name: &str,
        mime: &str,
        data: Bytes,
    ) -> Result<FileInfo, SessionError> {
        let size = data.len() as u64;
        if size == 0 {
            return Err(SessionError::EmptyFile);
        }
        if size > MAX_FILE_BYTES {
            return Err(SessionError::FileTooLarge {
                size,
                max: MAX_FILE_BYTES,
            });
        }
        if self.outgoing.len() >= MAX_INFLIGHT_TRANSFERS {
            return Err(SessionError::TooManyTransfers);
        }

        let info = FileInfo {
            file_id: derive_transfer_id(sender_id, name, now_unix_ms()),
            sender_id: sender_id.to_owned(),
            name: name.to_owned(),
            mime: mime.to_owned(),
            size,
            total_chunks: total_chunks_for(size),
        };
        self.outgoing.insert(
            info.file_id.clone(),
            OutgoingTransfer {
                info: info.clone(),
                data,
                next_index: 0,
            },
        );
        Ok(info)
    }

    /// Slices the next chunk of an outbound file. The transfer is forgotten
    /// once its last chunk has been handed out.
    pub fn next_chunk(&mut self, file_id: &str) -> Option<(FileChunk, bool)> {
        let transfer = self.outgoing.get_mut(file_id)?;
        let index = transfer.next_index;
        let start = index as usize * FILE_CHUNK_BYTES;
        let end = (start + FILE_CHUNK_BYTES).min(transfer.data.len());
        let chunk = FileChunk::new(file_id.to_owned(), index, &transfer.data[start..end]);
        transfer.next_index += 1;

        let last = transfer.next_index >= transfer.info.total_chunks;
        if last {
            self.outgoing.remove(file_id);
        }
        Some((chunk, last))
    }

    pub fn has_outgoing(&self, file_id: &str) -> bool {
        self.outgoing.contains_key(file_id)
    }

    /// Allocates reassembly state for an announced file and returns the
    /// activity marker for its idle check.
    pub fn begin_incoming(&mut self, info: FileInfo) -> Result<u64, TransferError> {
        let invalid = |reason: &str| TransferError::InvalidInfo {
            file_id: info.file_id.clone(),
            reason: reason.to_owned(),
        };
        if info.file_id.trim().is_empty() {
            return Err(invalid("empty file id"));
        }
        if info.size == 0 || info.size > MAX_FILE_BYTES {
            return Err(invalid("size out of range"));
        }
        if info.total_chunks == 0
            || info.total_chunks > MAX_TOTAL_CHUNKS
            || info.total_chunks != total_chunks_for(info.size)
        {
            return Err(invalid("chunk count does not match size"));
        }
        if let Some(existing) = self.incoming.get(&info.file_id) {
            return Ok(existing.activity);
        }
        if self.incoming.len() >= MAX_INFLIGHT_TRANSFERS {
            return Err(TransferError::TooManyTransfers);
        }

        let activity = self.bump_activity();
        self.incoming.insert(
            info.file_id.clone(),
            IncomingTransfer {
                chunks: vec![None; info.total_chunks as usize],
                received: 0,
                activity,
                info,
            },
        );
        Ok(activity)
    }

    /// Stores a chunk. A repeated index overwrites the earlier bytes without
    /// counting towards completion.
    pub fn accept_chunk(&mut self, chunk: &FileChunk) -> Result<TransferState, TransferError> {
        let activity = self.bump_activity();
        let transfer = self
            .incoming
            .get_mut(&chunk.file_id)
            .ok_or_else(|| TransferError::UnknownTransfer(chunk.file_id.clone()))?;
        let total = transfer.info.total_chunks;
        if chunk.index >= total {
            return Err(TransferError::ChunkOutOfRange {
                file_id: chunk.file_id.clone(),
                index: chunk.index,
                total,
            });
        }
        let bytes = chunk.decode_data().map_err(|err| TransferError::BadChunk {
            file_id: chunk.file_id.clone(),
            reason: err.to_string(),
        })?;

        transfer.activity = activity;
        let slot = &mut transfer.chunks[chunk.index as usize];
        if slot.is_none() {
            transfer.received += 1;
        }
        *slot = Some(bytes);

        if transfer.received < total {
            return Ok(TransferState::Collecting {
                received: transfer.received,
                total,
            });
        }

        let Some(transfer) = self.incoming.remove(&chunk.file_id) else {
            return Err(TransferError::UnknownTransfer(chunk.file_id.clone()));
        };
        let mut out = BytesMut::with_capacity(transfer.info.size as usize);
        for bytes in transfer.chunks.into_iter().flatten() {
            out.extend_from_slice(&bytes);
        }
        if out.len() as u64 != transfer.info.size {
            return Err(TransferError::SizeMismatch {
                file_id: transfer.info.file_id,
                expected: transfer.info.size,
                actual: out.len() as u64,
            });
        }

        Ok(TransferState::Complete(ReceivedFile {
            file_id: transfer.info.file_id,
            sender_id: transfer.info.sender_id,
            name: transfer.info.name,
            mime: transfer.info.mime,
            bytes: out.freeze(),
        }))
    }

    pub fn check_idle(&mut self, file_id: &str, armed_at: u64) -> IdleCheck {
        match self.incoming.get(file_id) {
            None => IdleCheck::Gone,
            Some(transfer) if transfer.activity != armed_at => IdleCheck::Active(transfer.activity),
            Some(_) => match self.incoming.remove(file_id) {
                Some(transfer) => IdleCheck::Stalled(transfer.info),
                None => IdleCheck::Gone,
            },
        }
    }

    pub fn incoming_progress(&self, file_id: &str) -> Option<(u32, u32)> {
        self.incoming
            .get(file_id)
            .map(|t| (t.received, t.info.total_chunks))
    }

    pub fn clear(&mut self) {
        self.incoming.clear();
        self.outgoing.clear();
    }

    fn bump_activity(&mut self) -> u64 {
        self.activity_seq += 1;
        self.activity_seq
    }
}
