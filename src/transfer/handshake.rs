//! Version/identity exchange over a freshly connected channel.
//!
//! Both sides behave the same: announce the local protocol version and
//! identity, then reply READY once the peer's identity checks out. The
//! exchange is symmetric, so neither side ever waits to send.

use super::wire::{self, MsgType, PROTOCOL_VERSION};
use crate::error::{Error, Result};
use crate::transport::{sys, Group, Message};
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    fn version_type(self) -> MsgType {
        match self {
            Role::Sender => MsgType::SenderVersion,
            Role::Receiver => MsgType::ReceiverVersion,
        }
    }

    fn expected_peer_version_type(self) -> MsgType {
        match self {
            Role::Sender => MsgType::ReceiverVersion,
            Role::Receiver => MsgType::SenderVersion,
        }
    }
}

/// An authenticated transfer session bound to one channel.
pub struct Link {
    group: Group,
    pub channel: u16,
    pub peer_ident: String,
    /// The version the conversation runs at: min(ours, theirs).
    pub peer_version: u32,
}

impl Link {
    pub async fn send(&self, ty: MsgType, body: Bytes) -> Result<()> {
        let msg = Message::with_body(0, ty as u16, body)?;
        self.group.bus().send(self.channel, msg).await
    }

    /// Send a pre-assembled (possibly scatter) message.
    pub async fn send_message(&self, mut msg: Message, ty: MsgType) -> Result<()> {
        msg.ty = ty as u16;
        self.group.bus().send(self.channel, msg).await
    }

    /// Next transfer-protocol message on this channel. `Err(Closed)` when
    /// the channel dies or the group shuts down.
    pub async fn recv(&self) -> Result<(MsgType, Bytes)> {
        loop {
            let msg = self.group.recv().await.map_err(|_| Error::Closed)?;
            if msg.ty == sys::CHANNEL_DIED {
                if msg.channel == self.channel {
                    return Err(Error::Closed);
                }
                continue;
            }
            if msg.channel != self.channel {
                continue;
            }
            let ty = MsgType::from_u16(msg.ty).ok_or_else(|| {
                Error::protocol(format!("unexpected message type {:#06x}", msg.ty))
            })?;
            return Ok((ty, msg.body()));
        }
    }

    /// Peers from version 2 on can be told about duplicates and rejections
    /// in-band; older ones only understand a disconnect.
    pub fn peer_supports_reject(&self) -> bool {
        self.peer_version >= 2
    }

    /// Orderly close of the session channel.
    pub fn close(&self) {
        self.group.bus().close_channel(self.channel);
    }

    /// Refuse the peer outright (bad identity, misconfiguration).
    pub async fn disconnect(&self) {
        let _ = self.send(MsgType::Disconnect, Bytes::new()).await;
        self.close();
    }
}

/// Run the handshake on `channel` within `group`. `allowed` restricts which
/// peer identities are acceptable; `None` accepts anyone.
pub async fn establish(
    group: Group,
    channel: u16,
    role: Role,
    local_ident: &str,
    allowed: Option<&[String]>,
) -> Result<Link> {
    match tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        exchange(&group, channel, role, local_ident, allowed),
    )
    .await
    {
        Ok(Ok((peer_ident, peer_version))) => {
            info!(peer = %peer_ident, version = peer_version, "peer ready");
            Ok(Link {
                group,
                channel,
                peer_ident,
                peer_version,
            })
        }
        Ok(Err(err)) => {
            group.bus().close_channel(channel);
            Err(err)
        }
        Err(_) => {
            group.bus().close_channel(channel);
            Err(Error::protocol("handshake timed out"))
        }
    }
}

async fn exchange(
    group: &Group,
    channel: u16,
    role: Role,
    local_ident: &str,
    allowed: Option<&[String]>,
) -> Result<(String, u32)> {
    let bus = group.bus();
    bus.send(
        channel,
        Message::with_body(
            0,
            role.version_type() as u16,
            wire::encode_version(PROTOCOL_VERSION),
        )?,
    )
    .await?;
    bus.send(
        channel,
        Message::with_body(0, MsgType::Ident as u16, wire::encode_ident(local_ident))?,
    )
    .await?;

    let mut peer_version: Option<u32> = None;
    let mut peer_ident: Option<String> = None;
    let mut peer_ready = false;
    let mut sent_ready = false;

    while !(peer_ready && sent_ready) {
        let msg = group.recv().await.map_err(|_| Error::Closed)?;
        if msg.ty == sys::CHANNEL_DIED {
            if msg.channel == channel {
                return Err(Error::Closed);
            }
            continue;
        }
        if msg.channel != channel {
            continue;
        }
        let ty = MsgType::from_u16(msg.ty)
            .ok_or_else(|| Error::protocol(format!("unexpected message type {:#06x}", msg.ty)))?;
        match ty {
            t if t == role.expected_peer_version_type() => {
                let version = wire::decode_version(msg.body())?;
                debug!(version, "peer version");
                peer_version = Some(version.min(PROTOCOL_VERSION));
            }
            MsgType::SenderVersion | MsgType::ReceiverVersion => {
                return Err(Error::protocol("peer claims the same role"));
            }
            MsgType::Ident => {
                let ident = wire::decode_ident(msg.body())?;
                if let Some(allowed) = allowed {
                    if !allowed.iter().any(|a| a == &ident) {
                        warn!(peer = %ident, "unknown peer identity, refusing");
                        let _ = bus
                            .send(
                                channel,
                                Message::with_body(0, MsgType::Disconnect as u16, Bytes::new())?,
                            )
                            .await;
                        return Err(Error::protocol(format!("unknown peer identity {ident}")));
                    }
                }
                peer_ident = Some(ident);
                bus.send(
                    channel,
                    Message::with_body(0, MsgType::Ready as u16, Bytes::new())?,
                )
                .await?;
                sent_ready = true;
            }
            MsgType::Ready => {
                peer_ready = true;
            }
            MsgType::DisconnectRetry => {
                return Err(Error::Closed);
            }
            MsgType::Disconnect => {
                return Err(Error::protocol("peer refused the session"));
            }
            other => {
                return Err(Error::protocol(format!(
                    "unexpected {other:?} during handshake"
                )));
            }
        }
    }

    let version = peer_version.ok_or_else(|| Error::protocol("peer never sent a version"))?;
    let ident = peer_ident.ok_or_else(|| Error::protocol("peer never sent an identity"))?;
    Ok((ident, version))
}
