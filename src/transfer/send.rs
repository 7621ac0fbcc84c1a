//! Send side of the file-transfer protocol.
//!
//! One call pushes one file through the NEW_FILE / FILE_BLOCK /
//! FILE_COMPLETE exchange. The file is memory-mapped and block payloads are
//! scatter segments borrowing from the map, so nothing is copied on the way
//! out; the map lives until the last in-flight segment is written.

use super::handshake::Link;
use super::wire::{self, MsgType, NewFile};
use crate::transport::{Message, Segment, MAX_BODY};
use bytes::Bytes;
use memmap2::Mmap;
use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Largest FILE_BLOCK payload: the body limit minus the 8-byte offset
/// prefix.
const MAX_CHUNK: usize = MAX_BODY - 8;

/// How one send attempt ended; drives the retry policy in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Transferred and acknowledged; the processing copy was unlinked.
    Succeeded,
    /// The peer or the protocol failed mid-transfer; worth retrying.
    Failed,
    /// The local file could not be read or mapped; worth retrying.
    LocalFailed,
    /// The peer rejected the file (duplicate, bad name, no space); the
    /// caller moves it aside and never retries.
    Impossible,
    /// Cleanup after success failed; the worker must come down.
    Fatal,
}

/// Transfer `path` to the peer behind `link`. The file is removed on
/// success.
pub async fn send_file(link: &Link, path: &Path, block_size: u32) -> SendOutcome {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.to_string(),
        None => {
            warn!(path = %path.display(), "unusable file name");
            return SendOutcome::LocalFailed;
        }
    };

    // FileInfo: open, stat, map, offer.
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            warn!(file = %name, %err, "cannot open for sending");
            return SendOutcome::LocalFailed;
        }
    };
    let meta = match file.metadata() {
        Ok(meta) => meta,
        Err(err) => {
            warn!(file = %name, %err, "cannot stat");
            return SendOutcome::LocalFailed;
        }
    };
    let size = meta.len();
    if usize::try_from(size).is_err() {
        warn!(file = %name, size, "file too large to map");
        return SendOutcome::LocalFailed;
    }
    let map = if size > 0 {
        match unsafe { Mmap::map(&file) } {
            Ok(map) => Some(Arc::new(map)),
            Err(err) => {
                warn!(file = %name, %err, "mmap failed");
                return SendOutcome::LocalFailed;
            }
        }
    } else {
        None
    };
    drop(file);

    let offer = NewFile {
        size,
        block_size,
        mode: meta.permissions().mode() & 0o777,
        name: name.clone(),
    };
    let started = Instant::now();
    if link.send(MsgType::NewFile, offer.encode()).await.is_err() {
        return SendOutcome::Failed;
    }

    // FileInfoAck.
    match link.recv().await {
        Ok((MsgType::NewFileReady, _)) => {}
        Ok((MsgType::DuplicateFile, _)) if link.peer_supports_reject() => {
            info!(file = %name, peer = %link.peer_ident, "peer reports duplicate");
            return SendOutcome::Impossible;
        }
        Ok((MsgType::RejectFile, _)) if link.peer_supports_reject() => {
            info!(file = %name, peer = %link.peer_ident, "peer rejected file");
            return SendOutcome::Impossible;
        }
        Ok((other, _)) => {
            warn!(file = %name, ?other, "unexpected reply to file offer");
            return SendOutcome::Failed;
        }
        Err(err) => {
            debug!(file = %name, %err, "link lost awaiting file offer reply");
            return SendOutcome::Failed;
        }
    }

    // SendFile: walk the map in block-sized chunks.
    if let Some(map) = &map {
        let chunk = (block_size as usize).clamp(1, MAX_CHUNK).min(size as usize);
        let mut offset = 0usize;
        while offset < size as usize {
            let len = chunk.min(size as usize - offset);
            let mut block = Message::new(0, MsgType::FileBlock as u16);
            let header = Segment::Bytes(wire::encode_block_offset(offset as u64));
            let payload = Segment::Mapped {
                map: Arc::clone(map),
                offset,
                len,
            };
            if block.push_segment(header).is_err() || block.push_segment(payload).is_err() {
                return SendOutcome::LocalFailed;
            }
            if link.send_message(block, MsgType::FileBlock).await.is_err() {
                return SendOutcome::Failed;
            }
            offset += len;
        }
    }

    // Complete.
    if link.send(MsgType::FileComplete, Bytes::new()).await.is_err() {
        return SendOutcome::Failed;
    }

    // CompleteAck.
    match link.recv().await {
        Ok((MsgType::FileComplete, _)) => {}
        Ok((other, _)) => {
            warn!(file = %name, ?other, "unexpected reply to completion");
            return SendOutcome::Failed;
        }
        Err(err) => {
            debug!(file = %name, %err, "link lost awaiting completion ack");
            return SendOutcome::Failed;
        }
    }

    let elapsed = started.elapsed();
    info!(
        file = %name,
        peer = %link.peer_ident,
        bytes = size,
        ms = elapsed.as_millis() as u64,
        "file delivered"
    );

    if let Err(err) = std::fs::remove_file(path) {
        warn!(file = %name, %err, "cannot unlink delivered file");
        return SendOutcome::Fatal;
    }
    SendOutcome::Succeeded
}
