//! Accept loop for inbound connections.
//!
//! Every candidate address gets its own bound socket; binding succeeds as a
//! whole when at least one address binds. Accepted sockets are wrapped in
//! TLS when the bus carries credentials, then registered with a pre-created
//! first channel for the initiator's announce.

use super::connection::{BoxedIo, Kind};
use super::group::Bus;
use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub(crate) async fn start(
    bus: &Bus,
    group_id: i32,
    addrs: &[SocketAddr],
    keepalive: u32,
) -> Result<Vec<SocketAddr>> {
    if addrs.is_empty() {
        return Err(Error::generic("no listen addresses configured"));
    }

    let mut listeners = Vec::new();
    let mut bound = Vec::new();
    let mut last_err = None;
    for addr in addrs {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                let local = listener.local_addr()?;
                info!(%local, "listening");
                bound.push(local);
                listeners.push(listener);
            }
            Err(err) => {
                warn!(%addr, %err, "bind failed");
                last_err = Some(err);
            }
        }
    }
    if listeners.is_empty() {
        return Err(match last_err {
            Some(err) => Error::System(err),
            None => Error::generic("could not bind any listen address"),
        });
    }

    for listener in listeners {
        let task = tokio::spawn(accept_loop(bus.clone(), group_id, listener, keepalive));
        bus.track_task(task);
    }
    Ok(bound)
}

async fn accept_loop(bus: Bus, group_id: i32, listener: TcpListener, keepalive: u32) {
    let mut shutdown = bus.shutdown_rx();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((tcp, peer)) => {
                    if let Err(err) = accept_one(&bus, tcp, peer, group_id, keepalive).await {
                        warn!(%peer, %err, "rejecting inbound connection");
                    }
                }
                Err(err) => {
                    // Transient accept failures (EMFILE and friends) must
                    // not spin the loop.
                    warn!(%err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    debug!("listener stopped");
}

async fn accept_one(
    bus: &Bus,
    tcp: TcpStream,
    peer: SocketAddr,
    group_id: i32,
    keepalive: u32,
) -> Result<()> {
    tcp.set_nodelay(true)?;
    let (io, kind): (BoxedIo, Kind) = match bus.credentials() {
        Some(creds) => {
            // The handshake happens inline; a verification failure means the
            // connection never reaches the reader/writer workers.
            let tls = creds
                .acceptor()
                .accept(tcp)
                .await
                .map_err(|e| Error::generic(format!("TLS handshake failed: {e}")))?;
            (Box::new(tls), Kind::Tls)
        }
        None => (Box::new(tcp), Kind::Tcp),
    };
    info!(%peer, %kind, "accepted connection");
    bus.accept_connection(io, peer, kind, group_id, keepalive)
}
