//! Multi-channel message bus over TCP or TLS.
//!
//! Many logical channels are multiplexed onto one socket through a framed,
//! length-prefixed codec. Each connection runs a reader and a writer
//! worker; channels are bundled into groups and drained through a
//! multiqueue. See the submodules for the moving parts:
//!
//! - [`message`]: the 6-byte header, scatter bodies, system control types
//! - [`codec`]: partial-IO-tolerant decode, resumable scatter writes
//! - [`channel`]: per-stream state and the announce/reply handshake
//! - [`connection`]: worker loops, keepalives, stagnation teardown
//! - [`group`]: the shared bus root, group split/merge, shutdown
//! - [`listener`]: the accept loop
//! - [`tls`]: mutually authenticated TLS sessions

pub mod channel;
pub mod codec;
pub mod connection;
pub mod group;
mod listener;
pub mod message;
pub mod tls;

pub use group::{Bus, Group};
pub use message::{sys, Message, Segment, CONTROL_CHANNEL, MAX_BODY};
pub use tls::Credentials;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiqueue::QueueError;
    use bytes::Bytes;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;
    use tokio::time::timeout;

    fn any_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    async fn recv_event(group: &Group, ty: u16) -> Message {
        loop {
            let msg = timeout(Duration::from_secs(5), group.recv())
                .await
                .expect("timed out waiting for event")
                .expect("group shut down");
            if msg.ty == ty {
                return msg;
            }
        }
    }

    /// The announce/reply handshake leaves both sides connected and an
    /// application message crosses over onto the matching channel.
    #[tokio::test]
    async fn handshake_and_cross_delivery() {
        let server = Bus::new(None);
        let server_group = server.group();
        let bound = server.listen(&server_group, &[any_addr()], 0).await.unwrap();

        let client = Bus::new(None);
        let client_group = client.group();
        let chan = client
            .connect(&client_group, "localhost", bound[0], 0)
            .await
            .unwrap();

        // The acceptor learns about the fresh channel.
        let event = recv_event(&server_group, sys::NEW_CONNECTION).await;
        let body = event.body();
        let server_chan = u16::from_be_bytes([body[0], body[1]]);

        client
            .send(
                chan,
                Message::with_body(0, 0x0042, Bytes::from_static(b"ping")).unwrap(),
            )
            .await
            .unwrap();

        let got = timeout(Duration::from_secs(5), server_group.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.channel, server_chan);
        assert_eq!(got.ty, 0x0042);
        assert_eq!(&got.body()[..], b"ping");

        // And the other direction.
        server
            .send(
                server_chan,
                Message::with_body(0, 0x0043, Bytes::from_static(b"pong")).unwrap(),
            )
            .await
            .unwrap();
        let back = timeout(Duration::from_secs(5), client_group.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(back.channel, chan);
        assert_eq!(back.ty, 0x0043);

        client.shutdown();
        server.shutdown();
        client.join().await;
        server.join().await;
    }

    /// Messages on one channel arrive in the order they were sent.
    #[tokio::test]
    async fn per_channel_ordering() {
        let server = Bus::new(None);
        let server_group = server.group();
        let bound = server.listen(&server_group, &[any_addr()], 0).await.unwrap();

        let client = Bus::new(None);
        let client_group = client.group();
        let chan = client
            .connect(&client_group, "localhost", bound[0], 0)
            .await
            .unwrap();
        recv_event(&server_group, sys::NEW_CONNECTION).await;

        for i in 0..100u16 {
            client
                .send(
                    chan,
                    Message::with_body(0, 1, Bytes::copy_from_slice(&i.to_be_bytes())).unwrap(),
                )
                .await
                .unwrap();
        }
        for i in 0..100u16 {
            let msg = timeout(Duration::from_secs(5), server_group.recv())
                .await
                .unwrap()
                .unwrap();
            let body = msg.body();
            assert_eq!(u16::from_be_bytes([body[0], body[1]]), i);
        }

        client.shutdown();
        server.shutdown();
        client.join().await;
        server.join().await;
    }

    /// Killing a channel from one side surfaces CHANNEL_DIED on the other.
    #[tokio::test]
    async fn kill_fires_channel_died() {
        let server = Bus::new(None);
        let server_group = server.group();
        let bound = server.listen(&server_group, &[any_addr()], 0).await.unwrap();

        let client = Bus::new(None);
        let client_group = client.group();
        let chan = client
            .connect(&client_group, "localhost", bound[0], 0)
            .await
            .unwrap();
        let event = recv_event(&server_group, sys::NEW_CONNECTION).await;
        let body = event.body();
        let server_chan = u16::from_be_bytes([body[0], body[1]]);

        client.close_channel(chan);

        let died = recv_event(&server_group, sys::CHANNEL_DIED).await;
        assert_eq!(died.channel, server_chan);

        client.shutdown();
        server.shutdown();
        client.join().await;
        server.join().await;
    }

    /// Dropping the peer's bus entirely also surfaces CHANNEL_DIED.
    #[tokio::test]
    async fn connection_death_cascades_to_channels() {
        let server = Bus::new(None);
        let server_group = server.group();
        let bound = server.listen(&server_group, &[any_addr()], 0).await.unwrap();

        let client = Bus::new(None);
        let client_group = client.group();
        let _chan = client
            .connect(&client_group, "localhost", bound[0], 0)
            .await
            .unwrap();
        recv_event(&server_group, sys::NEW_CONNECTION).await;

        client.shutdown();
        client.join().await;

        let died = recv_event(&server_group, sys::CHANNEL_DIED).await;
        assert_eq!(died.ty, sys::CHANNEL_DIED);

        server.shutdown();
        server.join().await;
    }

    /// Splitting moves a channel's traffic into the new group.
    #[tokio::test]
    async fn split_moves_channel_traffic() {
        let server = Bus::new(None);
        let server_group = server.group();
        let bound = server.listen(&server_group, &[any_addr()], 0).await.unwrap();

        let client = Bus::new(None);
        let client_group = client.group();
        let chan = client
            .connect(&client_group, "localhost", bound[0], 0)
            .await
            .unwrap();
        let event = recv_event(&server_group, sys::NEW_CONNECTION).await;
        let body = event.body();
        let server_chan = u16::from_be_bytes([body[0], body[1]]);

        let session_group = server_group.split(server_chan).unwrap();

        client
            .send(chan, Message::with_body(0, 7, Bytes::from_static(b"x")).unwrap())
            .await
            .unwrap();

        let got = timeout(Duration::from_secs(5), session_group.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.channel, server_chan);

        // The original group no longer sees channel traffic.
        assert!(matches!(server_group.try_recv(), Ok(None)));

        client.shutdown();
        server.shutdown();
        client.join().await;
        server.join().await;
    }

    /// Group shutdown unblocks a live receiver.
    #[tokio::test]
    async fn group_shutdown_unblocks_recv() {
        let bus = Bus::new(None);
        let group = bus.group();
        let g2 = group.clone();
        let waiter = tokio::spawn(async move { g2.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        group.shutdown();
        assert!(matches!(waiter.await.unwrap(), Err(QueueError::Shutdown)));
    }

    /// Binding succeeds when at least one candidate address binds.
    #[tokio::test]
    async fn listen_tolerates_partial_bind_failure() {
        let bus = Bus::new(None);
        let group = bus.group();
        let first = bus.listen(&group, &[any_addr()], 0).await.unwrap();

        // Same port again fails; adding a wildcard port keeps it viable.
        let bus2 = Bus::new(None);
        let group2 = bus2.group();
        let bound = bus2
            .listen(&group2, &[first[0], any_addr()], 0)
            .await
            .unwrap();
        assert_eq!(bound.len(), 1);

        bus.shutdown();
        bus2.shutdown();
        bus.join().await;
        bus2.join().await;
    }
}
