//! Per-connection receive session.
//!
//! For each offered file the session reserves the final name with a
//! zero-length mode-0 placeholder, streams payload into a hidden dot-file
//! through a writable memory map, and commits with an atomic rename so a
//! partial file is never visible under its final name. A global inode set
//! catches two senders pushing the same name at once.

use super::post::PostCommand;
use super::space::SpaceAdmitter;
use crate::error::{Error, Result};
use crate::fsutil;
use crate::transfer::wire::{self, MsgType, NewFile};
use crate::transfer::Link;
use bytes::Bytes;
use memmap2::MmapMut;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Inodes of placeholders currently being filled, across every session.
#[derive(Default)]
pub struct Inflight {
    inner: Mutex<HashSet<u64>>,
}

impl Inflight {
    pub fn insert(&self, ino: u64) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ino);
    }

    pub fn remove(&self, ino: u64) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ino);
    }

    pub fn contains(&self, ino: u64) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&ino)
    }
}

/// Resources shared by every session on one receiver.
pub struct SessionShared {
    pub dest_dir: PathBuf,
    pub dup_dirs: Vec<PathBuf>,
    pub unique_duplicates: bool,
    pub space: SpaceAdmitter,
    pub inflight: Inflight,
    pub post: Option<PostCommand>,
    /// Serializes placeholder creation so two sessions cannot both win the
    /// same name.
    reserve_lock: Mutex<()>,
}

impl SessionShared {
    pub fn new(
        dest_dir: PathBuf,
        dup_dirs: Vec<PathBuf>,
        unique_duplicates: bool,
        space: SpaceAdmitter,
        post: Option<PostCommand>,
    ) -> Self {
        Self {
            dest_dir,
            dup_dirs,
            unique_duplicates,
            space,
            inflight: Inflight::default(),
            post,
            reserve_lock: Mutex::new(()),
        }
    }
}

/// Why an offered file is being refused.
enum Refusal {
    /// Someone already has (or is writing) this name, or space ran out.
    Duplicate,
    /// The offer itself is unacceptable.
    Reject,
}

impl Refusal {
    fn msg_type(&self) -> MsgType {
        match self {
            Refusal::Duplicate => MsgType::DuplicateFile,
            Refusal::Reject => MsgType::RejectFile,
        }
    }
}

/// Cleans up a half-received file unless committed first.
struct Reservation<'a> {
    shared: &'a SessionShared,
    placeholder: PathBuf,
    dot_path: PathBuf,
    ino: u64,
    reserved: u64,
    armed: bool,
}

impl<'a> Reservation<'a> {
    /// Mark success: forget the paths, return the accounting.
    fn commit(mut self) {
        self.armed = false;
        self.shared.inflight.remove(self.ino);
        self.shared.space.release(self.reserved);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let _ = fs::remove_file(&self.dot_path);
        let _ = fs::remove_file(&self.placeholder);
        self.shared.inflight.remove(self.ino);
        self.shared.space.release(self.reserved);
    }
}

/// Final-name rules: a bare basename that cannot collide with the dot-file
/// convention or escape the destination directory.
fn validate_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 {
        return false;
    }
    if name.starts_with('.') {
        return false;
    }
    if name.contains('/') || name.contains('\0') {
        return false;
    }
    true
}

/// Run the receive loop on one authenticated link until the peer goes
/// away. Returns how many files landed.
pub async fn run(link: Link, shared: Arc<SessionShared>) -> Result<u64> {
    let mut delivered = 0u64;
    loop {
        let (ty, body) = match link.recv().await {
            Ok(msg) => msg,
            Err(Error::Closed) => break,
            Err(err) => {
                link.close();
                return Err(err);
            }
        };
        match ty {
            MsgType::NewFile => {
                let offer = match NewFile::decode(body) {
                    Ok(offer) => offer,
                    Err(err) => {
                        link.close();
                        return Err(err);
                    }
                };
                match receive_one(&link, &shared, &offer).await {
                    Ok(true) => delivered += 1,
                    Ok(false) => {
                        // Refused in-band; wait for the next offer.
                        if !link.peer_supports_reject() {
                            // A version-1 peer only understands a
                            // disconnect.
                            link.close();
                            break;
                        }
                    }
                    Err(Error::Closed) => break,
                    Err(err) => {
                        link.close();
                        return Err(err);
                    }
                }
            }
            MsgType::DisconnectRetry | MsgType::Disconnect => break,
            other => {
                link.close();
                return Err(Error::protocol(format!(
                    "unexpected {other:?} while awaiting a file offer"
                )));
            }
        }
    }
    Ok(delivered)
}

/// Handle one NEW_FILE offer end to end. `Ok(true)` means the file landed,
/// `Ok(false)` that it was refused and the refusal was sent (when the peer
/// can understand it).
async fn receive_one(link: &Link, shared: &SessionShared, offer: &NewFile) -> Result<bool> {
    if !validate_name(&offer.name) {
        warn!(peer = %link.peer_ident, name = %offer.name, "refusing unusable file name");
        return refuse(link, Refusal::Reject).await;
    }

    // Admission before anything touches the disk.
    match shared.space.admit(offer.size) {
        Ok(true) => {}
        Ok(false) => {
            warn!(
                peer = %link.peer_ident,
                file = %offer.name,
                size = offer.size,
                "no room for file"
            );
            return refuse(link, Refusal::Duplicate).await;
        }
        Err(err) => {
            warn!(file = %offer.name, %err, "cannot check free space");
            return refuse(link, Refusal::Reject).await;
        }
    }

    let reservation = match reserve(shared, offer) {
        Ok(res) => res,
        Err(refusal) => {
            shared.space.release(offer.size);
            return refuse(link, refusal).await;
        }
    };

    let mut map = match open_dot_file(&reservation, offer) {
        Ok(map) => map,
        Err(err) => {
            warn!(file = %offer.name, %err, "cannot stage file");
            drop(reservation);
            return refuse(link, Refusal::Reject).await;
        }
    };

    link.send(MsgType::NewFileReady, Bytes::new()).await?;

    // FILE_BLOCK stream until FILE_COMPLETE.
    loop {
        let (ty, body) = link.recv().await?;
        match ty {
            MsgType::FileBlock => {
                let (offset, payload) = wire::decode_block(body)?;
                let end = offset
                    .checked_add(payload.len() as u64)
                    .ok_or_else(|| Error::protocol("file block offset overflow"))?;
                if end > offer.size {
                    return Err(Error::protocol(format!(
                        "file block {}..{} outside {}-byte file",
                        offset, end, offer.size
                    )));
                }
                if let Some(map) = map.as_mut() {
                    map[offset as usize..end as usize].copy_from_slice(&payload);
                }
            }
            MsgType::FileComplete => break,
            other => {
                return Err(Error::protocol(format!(
                    "unexpected {other:?} during file payload"
                )));
            }
        }
    }

    // Commit: settle the map, mirror to duplicate directories, then make
    // the file appear atomically under its final name.
    if let Some(map) = map.take() {
        map.flush().map_err(Error::System)?;
    }

    for dup_dir in &shared.dup_dirs {
        let dup_path = dup_dir.join(&offer.name);
        if let Err(err) =
            fsutil::link_or_copy(&reservation.dot_path, &dup_path, shared.unique_duplicates)
        {
            warn!(
                file = %offer.name,
                dup = %dup_dir.display(),
                %err,
                "cannot mirror into duplicate directory"
            );
        }
    }

    fs::rename(&reservation.dot_path, &reservation.placeholder).map_err(Error::System)?;

    let final_path = reservation.placeholder.clone();
    reservation.commit();

    link.send(MsgType::FileComplete, Bytes::new()).await?;

    info!(
        peer = %link.peer_ident,
        file = %offer.name,
        bytes = offer.size,
        "file received"
    );

    if let Some(post) = &shared.post {
        post.spawn(&final_path, &link.peer_ident);
    }
    Ok(true)
}

async fn refuse(link: &Link, refusal: Refusal) -> Result<bool> {
    if link.peer_supports_reject() {
        link.send(refusal.msg_type(), Bytes::new()).await?;
    }
    Ok(false)
}

/// Claim the final name with a zero-length, mode-0 placeholder. Runs under
/// the shared reservation lock so concurrent sessions serialize here.
fn reserve<'a>(
    shared: &'a SessionShared,
    offer: &NewFile,
) -> std::result::Result<Reservation<'a>, Refusal> {
    let placeholder = shared.dest_dir.join(&offer.name);
    let dot_path = shared.dest_dir.join(format!(".{}", offer.name));

    let _guard = shared
        .reserve_lock
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

    let file = match create_placeholder(&placeholder) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            // A regular, empty, mode-0 file whose inode is in the in-progress
            // set means another sender is concurrently pushing this name.
            if let Ok(meta) = fs::symlink_metadata(&placeholder) {
                if meta.is_file()
                    && meta.len() == 0
                    && meta.permissions().mode() & 0o7777 == 0
                    && shared.inflight.contains(meta.ino())
                {
                    warn!(
                        file = %offer.name,
                        "another sender is already transferring this name"
                    );
                    return Err(Refusal::Duplicate);
                }
            }
            // Stale leftover: clear it and try exactly once more.
            if fs::remove_file(&placeholder).is_err() {
                return Err(Refusal::Reject);
            }
            match create_placeholder(&placeholder) {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    return Err(Refusal::Duplicate);
                }
                Err(_) => return Err(Refusal::Reject),
            }
        }
        Err(err) => {
            debug!(file = %offer.name, %err, "cannot create placeholder");
            return Err(Refusal::Reject);
        }
    };

    let ino = match file.metadata() {
        Ok(meta) => meta.ino(),
        Err(_) => {
            let _ = fs::remove_file(&placeholder);
            return Err(Refusal::Reject);
        }
    };
    shared.inflight.insert(ino);

    Ok(Reservation {
        shared,
        placeholder,
        dot_path,
        ino,
        reserved: offer.size,
        armed: true,
    })
}

fn create_placeholder(path: &PathBuf) -> std::io::Result<fs::File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0)
        .open(path)
}

/// Create the hidden working file with the sender's mode, pre-extend it to
/// the final size, and map it writable. The descriptor is closed here; the
/// mapping keeps the file reachable.
fn open_dot_file(reservation: &Reservation<'_>, offer: &NewFile) -> std::io::Result<Option<MmapMut>> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(offer.mode & 0o777)
        .open(&reservation.dot_path)?;
    if offer.size == 0 {
        return Ok(None);
    }
    file.seek(SeekFrom::Start(offer.size - 1))?;
    file.write_all(&[0u8])?;
    let map = unsafe { MmapMut::map_mut(&file)? };
    Ok(Some(map))
}
