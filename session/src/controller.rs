//! The mesh controller.
//!
//! A single task owns all distributed state (peer registry, route table,
//! broadcast dedup, stamp clock) and is the only writer to it. Everything
//! else reaches the controller through events: authenticated streams from
//! the listener and dialer, link teardown and inbound frames from link
//! tasks, Ethernet frames from the TAP pump, and the two timers.

use crate::link;
use crate::registry::{LinkHandle, PeerRegistry};
use crate::seed::Seed;
use crate::transport::{self, IoStream};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tapmesh_routing::{BroadcastDedup, Observation, RouteTable, StampClock};
use tapmesh_tap::TapFrame;
use tapmesh_wire::{Frame, MacAddr, PROTOCOL_VERSION};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for the mesh controller
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// This node's MAC identity
    pub local_mac: MacAddr,
    /// Interval between announce floods
    pub announce_interval: Duration,
    /// Interval between link-count checks against the seed
    pub reconnect_interval: Duration,
    /// Dial the seed while fewer than this many links are up
    pub min_links: usize,
}

impl ControllerConfig {
    /// Default timing for a node identified by `local_mac`.
    pub fn new(local_mac: MacAddr) -> Self {
        Self {
            local_mac,
            announce_interval: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(60),
            min_links: 2,
        }
    }
}

/// Events delivered to the controller
#[derive(Debug)]
pub enum MeshEvent {
    /// An authenticated stream for peer `mac`, ready to become a link
    LinkReady {
        /// Identity proven by the peer's certificate
        mac: MacAddr,
        /// The established stream
        stream: IoStream,
    },
    /// A link task terminated
    LinkDown {
        /// Peer the link belonged to
        peer: MacAddr,
        /// Id of the terminated link instance
        link_id: u64,
    },
    /// A frame arrived on a link
    FrameRx {
        /// Directly-linked peer the frame arrived from
        peer: MacAddr,
        /// The decoded frame
        frame: Frame,
    },
}

/// Outbound bootstrap: the seed to dial and the TLS config pinned to it
#[derive(Clone)]
pub struct Connector {
    /// Seed identity and address
    pub seed: Seed,
    /// Client TLS configuration pinned to the seed's MAC
    pub tls: Arc<rustls::ClientConfig>,
}

/// The mesh controller task
pub struct MeshController {
    config: ControllerConfig,
    registry: PeerRegistry,
    routes: RouteTable,
    dedup: BroadcastDedup,
    clock: StampClock,
    events_rx: mpsc::Receiver<MeshEvent>,
    events_tx: mpsc::Sender<MeshEvent>,
    tap_rx: mpsc::Receiver<TapFrame>,
    tap_tx: mpsc::Sender<TapFrame>,
    connector: Option<Connector>,
    next_link_id: u64,
}

impl MeshController {
    /// Create a controller.
    ///
    /// `tap_rx` delivers frames read from the TAP device; frames the mesh
    /// wants injected locally are sent to `tap_tx`. The returned sender is
    /// the event channel for the listener (and anything else producing
    /// [`MeshEvent::LinkReady`]).
    pub fn new(
        config: ControllerConfig,
        tap_rx: mpsc::Receiver<TapFrame>,
        tap_tx: mpsc::Sender<TapFrame>,
        connector: Option<Connector>,
    ) -> (Self, mpsc::Sender<MeshEvent>) {
        let (events_tx, events_rx) = mpsc::channel(1024);
        let controller = Self {
            registry: PeerRegistry::new(config.local_mac),
            routes: RouteTable::new(config.local_mac),
            dedup: BroadcastDedup::new(),
            clock: StampClock::new(),
            config,
            events_rx,
            events_tx: events_tx.clone(),
            tap_rx,
            tap_tx,
            connector,
            next_link_id: 0,
        };
        (controller, events_tx)
    }

    /// Run the controller until the TAP pump goes away.
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!(
            "Mesh controller running as {} (announce {:?}, reconnect {:?})",
            self.config.local_mac, self.config.announce_interval, self.config.reconnect_interval
        );

        let mut announce = interval(self.config.announce_interval);
        announce.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reconnect = interval(self.config.reconnect_interval);
        reconnect.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // The controller holds an events_tx clone, so this channel
                // never reports closed.
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await;
                }

                maybe_frame = self.tap_rx.recv() => {
                    match maybe_frame {
                        Some(frame) => self.handle_tap_egress(frame),
                        None => {
                            info!("TAP endpoint gone, controller stopping");
                            break;
                        }
                    }
                }

                _ = announce.tick() => self.handle_announce_tick(),

                _ = reconnect.tick() => self.handle_reconnect_tick(),
            }
        }

        Ok(())
    }

    async fn handle_event(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::LinkReady { mac, stream } => self.handle_link_ready(mac, stream),
            MeshEvent::LinkDown { peer, link_id } => {
                if self.registry.detach_link(peer, link_id) {
                    info!("Link down: {}", peer);
                } else {
                    debug!("Ignoring stale link-down for {} (id {})", peer, link_id);
                }
            }
            MeshEvent::FrameRx { peer, frame } => self.handle_frame(peer, frame).await,
        }
    }

    fn handle_link_ready(&mut self, mac: MacAddr, stream: IoStream) {
        if mac == self.config.local_mac {
            info!("Connected to self, closing");
            return;
        }
        if self.registry.is_linked(mac) {
            info!("Already linked to {}, closing duplicate", mac);
            return;
        }

        let link_id = self.next_link_id;
        self.next_link_id += 1;

        let tx = link::spawn_link(mac, link_id, stream, self.events_tx.clone());
        let attached = self.registry.attach_link(mac, LinkHandle::new(tx, link_id));
        debug_assert!(attached);
        info!(
            "Link up: {} ({} linked peers)",
            mac,
            self.registry.linked_count()
        );
    }

    async fn handle_frame(&mut self, peer: MacAddr, frame: Frame) {
        match frame {
            Frame::Announce {
                version,
                stamp,
                origin,
            } => {
                if version != PROTOCOL_VERSION {
                    debug!("Dropping announce with version {} from {}", version, peer);
                    return;
                }
                if origin == self.config.local_mac {
                    debug!("Dropping our own announce echoed by {}", peer);
                    return;
                }
                match self.routes.observe(origin, peer, stamp) {
                    Observation::Accepted => {
                        // Forward verbatim; the sender's own stamp check
                        // filters the copy it gets back.
                        self.flood_frame(&Frame::Announce {
                            version,
                            stamp,
                            origin,
                        });
                    }
                    Observation::Stale => {}
                }
            }

            Frame::Broadcast {
                stamp,
                src,
                payload,
            } => {
                if src == self.config.local_mac {
                    debug!("Dropping our own broadcast echoed by {}", peer);
                    return;
                }
                if !self.dedup.insert(src, stamp) {
                    debug!("Dropping duplicate broadcast {} from {}", stamp, src);
                    return;
                }
                self.inject_tap(TapFrame {
                    src,
                    dst: MacAddr::BROADCAST,
                    payload: payload.clone(),
                })
                .await;
                self.flood_frame(&Frame::Broadcast {
                    stamp,
                    src,
                    payload,
                });
            }

            Frame::Unicast { dst, src, payload } => {
                if dst == self.config.local_mac {
                    self.inject_tap(TapFrame { src, dst, payload }).await;
                } else {
                    self.forward_unicast(Frame::Unicast { dst, src, payload });
                }
            }
        }
    }

    fn handle_tap_egress(&mut self, frame: TapFrame) {
        // We must not forge other origins
        if frame.src != self.config.local_mac {
            debug!(
                "Dropping tap frame with foreign source {} (local is {})",
                frame.src, self.config.local_mac
            );
            return;
        }

        if frame.dst.is_broadcast() {
            let stamp = self.clock.next();
            self.dedup.insert(frame.src, stamp);
            self.flood_frame(&Frame::Broadcast {
                stamp,
                src: frame.src,
                payload: frame.payload,
            });
        } else {
            self.forward_unicast(Frame::Unicast {
                dst: frame.dst,
                src: frame.src,
                payload: frame.payload,
            });
        }
    }

    fn handle_announce_tick(&mut self) {
        let stamp = self.clock.next();
        debug!("Announcing {} (stamp {})", self.config.local_mac, stamp);
        self.flood_frame(&Frame::announce(stamp, self.config.local_mac));
    }

    fn handle_reconnect_tick(&mut self) {
        if self.registry.linked_count() >= self.config.min_links {
            return;
        }
        let Some(connector) = self.connector.clone() else {
            return;
        };

        info!(
            "{} of {} links up, dialing seed {}",
            self.registry.linked_count(),
            self.config.min_links,
            connector.seed
        );

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            match transport::dial_seed(&connector.seed, connector.tls).await {
                Ok((stream, mac)) => {
                    let _ = events.send(MeshEvent::LinkReady { mac, stream }).await;
                }
                Err(e) => warn!("Seed connection to {} failed: {:#}", connector.seed, e),
            }
        });
    }

    /// Route a unicast frame to the next hop for its destination.
    fn forward_unicast(&mut self, frame: Frame) {
        let Frame::Unicast { dst, .. } = &frame else {
            return;
        };
        let dst = *dst;

        let Some(entry) = self.routes.lookup(dst) else {
            debug!("No route to {}, dropping", dst);
            return;
        };
        // The route may outlive the link it was learned over
        let Some(handle) = self.registry.link(entry.next_hop) else {
            debug!(
                "Next hop {} for {} has no live link, dropping",
                entry.next_hop, dst
            );
            return;
        };
        let frame_bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("Dropping unencodable frame for {}: {}", dst, e);
                return;
            }
        };
        if !handle.push(frame_bytes) {
            debug!("Send queue for {} is gone, dropping", entry.next_hop);
        }
    }

    /// Encode a frame and push it onto every linked peer's send queue.
    fn flood_frame(&mut self, frame: &Frame) {
        match frame.encode() {
            Ok(bytes) => self.flood(bytes),
            Err(e) => debug!("Dropping unencodable frame: {}", e),
        }
    }

    /// Push a frame onto every linked peer's send queue.
    fn flood(&mut self, frame_bytes: Bytes) {
        for (mac, handle) in self.registry.iter_linked() {
            if !handle.push(frame_bytes.clone()) {
                debug!("Send queue for {} is gone, skipping", mac);
            }
        }
    }

    /// Hand a frame to the local TAP endpoint.
    async fn inject_tap(&mut self, frame: TapFrame) {
        if self.tap_tx.send(frame).await.is_err() {
            warn!("TAP endpoint gone, dropping inbound frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    const RECV_TIMEOUT: Duration = Duration::from_secs(2);
    const SILENCE: Duration = Duration::from_millis(300);

    struct TestNode {
        mac: MacAddr,
        events: mpsc::Sender<MeshEvent>,
        tap_in: mpsc::Sender<TapFrame>,
        tap_out: mpsc::Receiver<TapFrame>,
    }

    fn spawn_node(mac_str: &str, announce: Duration) -> TestNode {
        let mac: MacAddr = mac_str.parse().unwrap();
        let mut config = ControllerConfig::new(mac);
        config.announce_interval = announce;
        config.reconnect_interval = Duration::from_secs(3600);

        let (tap_in_tx, tap_in_rx) = mpsc::channel(64);
        let (tap_out_tx, tap_out_rx) = mpsc::channel(64);
        let (controller, events) = MeshController::new(config, tap_in_rx, tap_out_tx, None);
        tokio::spawn(controller.run());

        TestNode {
            mac,
            events,
            tap_in: tap_in_tx,
            tap_out: tap_out_rx,
        }
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    /// Wire two nodes together as if both sides had completed a handshake.
    async fn link_nodes(a: &TestNode, b: &TestNode) {
        let (sa, sb) = tcp_pair().await;
        a.events
            .send(MeshEvent::LinkReady {
                mac: b.mac,
                stream: IoStream::Plain(sa),
            })
            .await
            .unwrap();
        b.events
            .send(MeshEvent::LinkReady {
                mac: a.mac,
                stream: IoStream::Plain(sb),
            })
            .await
            .unwrap();
    }

    fn eth(payload: &'static [u8]) -> Bytes {
        Bytes::from_static(payload)
    }

    async fn recv_tap(node: &mut TestNode) -> TapFrame {
        timeout(RECV_TIMEOUT, node.tap_out.recv())
            .await
            .expect("timed out waiting for tap injection")
            .expect("tap channel closed")
    }

    async fn assert_tap_silent(node: &mut TestNode) {
        assert!(
            timeout(SILENCE, node.tap_out.recv()).await.is_err(),
            "unexpected extra tap injection"
        );
    }

    #[tokio::test]
    async fn test_two_node_unicast() {
        let a = spawn_node("aa:aa:aa:aa:aa:aa", Duration::from_millis(25));
        let mut b = spawn_node("bb:bb:bb:bb:bb:bb", Duration::from_millis(25));
        link_nodes(&a, &b).await;

        // Let the announce timers run so A learns a route to B
        tokio::time::sleep(Duration::from_millis(250)).await;

        a.tap_in
            .send(TapFrame {
                src: a.mac,
                dst: b.mac,
                payload: eth(b"\x08\x00hi"),
            })
            .await
            .unwrap();

        let delivered = recv_tap(&mut b).await;
        assert_eq!(delivered.src, a.mac);
        assert_eq!(delivered.dst, b.mac);
        assert_eq!(delivered.payload, eth(b"\x08\x00hi"));
    }

    #[tokio::test]
    async fn test_three_node_transit() {
        let mut a = spawn_node("aa:aa:aa:aa:aa:aa", Duration::from_millis(25));
        let b = spawn_node("bb:bb:bb:bb:bb:bb", Duration::from_millis(25));
        let c = spawn_node("cc:cc:cc:cc:cc:cc", Duration::from_millis(25));
        link_nodes(&a, &b).await;
        link_nodes(&b, &c).await;

        // Two announce cycles so C learns A via B
        tokio::time::sleep(Duration::from_millis(400)).await;

        c.tap_in
            .send(TapFrame {
                src: c.mac,
                dst: a.mac,
                payload: eth(b"\x08\x00transit"),
            })
            .await
            .unwrap();

        let delivered = recv_tap(&mut a).await;
        assert_eq!(delivered.src, c.mac);
        assert_eq!(delivered.dst, a.mac);
        assert_eq!(delivered.payload, eth(b"\x08\x00transit"));

        // Exactly once
        assert_tap_silent(&mut a).await;
    }

    #[tokio::test]
    async fn test_triangle_broadcast_exactly_once() {
        let a = spawn_node("aa:aa:aa:aa:aa:aa", Duration::from_millis(25));
        let mut b = spawn_node("bb:bb:bb:bb:bb:bb", Duration::from_millis(25));
        let mut c = spawn_node("cc:cc:cc:cc:cc:cc", Duration::from_millis(25));
        link_nodes(&a, &b).await;
        link_nodes(&b, &c).await;
        link_nodes(&a, &c).await;

        tokio::time::sleep(Duration::from_millis(200)).await;

        a.tap_in
            .send(TapFrame {
                src: a.mac,
                dst: MacAddr::BROADCAST,
                payload: eth(b"\x08\x06who-has"),
            })
            .await
            .unwrap();

        // B and C each inject exactly one copy despite the cycle
        for node in [&mut b, &mut c] {
            let delivered = recv_tap(node).await;
            assert_eq!(delivered.src, "aa:aa:aa:aa:aa:aa".parse::<MacAddr>().unwrap());
            assert!(delivered.dst.is_broadcast());
            assert_eq!(delivered.payload, eth(b"\x08\x06who-has"));
        }
        assert_tap_silent(&mut b).await;
        assert_tap_silent(&mut c).await;
    }

    #[tokio::test]
    async fn test_self_connect_rejected() {
        let a = spawn_node("aa:aa:aa:aa:aa:aa", Duration::from_secs(3600));
        let (sa, mut remote) = tcp_pair().await;

        a.events
            .send(MeshEvent::LinkReady {
                mac: a.mac,
                stream: IoStream::Plain(sa),
            })
            .await
            .unwrap();

        // The controller drops the stream without attaching a link
        let mut buf = [0u8; 16];
        let n = timeout(RECV_TIMEOUT, remote.read(&mut buf))
            .await
            .expect("peer socket was not closed")
            .unwrap();
        assert_eq!(n, 0, "expected EOF on the rejected self-connection");
    }

    #[tokio::test]
    async fn test_duplicate_link_rejected() {
        let a = spawn_node("aa:aa:aa:aa:aa:aa", Duration::from_millis(25));
        let b_mac: MacAddr = "bb:bb:bb:bb:bb:bb".parse().unwrap();

        let (sa1, mut remote1) = tcp_pair().await;
        let (sa2, mut remote2) = tcp_pair().await;

        a.events
            .send(MeshEvent::LinkReady {
                mac: b_mac,
                stream: IoStream::Plain(sa1),
            })
            .await
            .unwrap();
        a.events
            .send(MeshEvent::LinkReady {
                mac: b_mac,
                stream: IoStream::Plain(sa2),
            })
            .await
            .unwrap();

        // The second stream is closed after the handshake
        let mut buf = [0u8; 16];
        let n = timeout(RECV_TIMEOUT, remote2.read(&mut buf))
            .await
            .expect("duplicate socket was not closed")
            .unwrap();
        assert_eq!(n, 0, "expected EOF on the duplicate link");

        // The surviving link still carries traffic (announces)
        let n = timeout(RECV_TIMEOUT, remote1.read(&mut buf))
            .await
            .expect("no traffic on the surviving link")
            .unwrap();
        assert!(n > 0);
    }

    #[tokio::test]
    async fn test_version_mismatch_announce_not_reflooded() {
        use tokio::io::AsyncWriteExt;

        let a = spawn_node("aa:aa:aa:aa:aa:aa", Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let origin: MacAddr = "dd:dd:dd:dd:dd:dd".parse().unwrap();
        let (sa1, mut remote1) = tcp_pair().await;
        let (sa2, mut remote2) = tcp_pair().await;
        a.events
            .send(MeshEvent::LinkReady {
                mac: "bb:bb:bb:bb:bb:bb".parse().unwrap(),
                stream: IoStream::Plain(sa1),
            })
            .await
            .unwrap();
        a.events
            .send(MeshEvent::LinkReady {
                mac: "cc:cc:cc:cc:cc:cc".parse().unwrap(),
                stream: IoStream::Plain(sa2),
            })
            .await
            .unwrap();

        // An announce at an unknown version must not reach the other link
        let bad = Frame::Announce {
            version: 2,
            stamp: 5,
            origin,
        };
        remote1.write_all(&bad.encode().unwrap()).await.unwrap();

        let mut buf = [0u8; 64];
        assert!(
            timeout(SILENCE, remote2.read(&mut buf)).await.is_err(),
            "version-2 announce was re-flooded"
        );

        // The same origin at the current version is accepted and re-flooded
        remote1
            .write_all(&Frame::announce(6, origin).encode().unwrap())
            .await
            .unwrap();
        let n = timeout(RECV_TIMEOUT, remote2.read(&mut buf))
            .await
            .expect("accepted announce was not re-flooded")
            .unwrap();
        assert!(n > 0);
    }

    #[tokio::test]
    async fn test_tap_source_forgery_dropped() {
        // Announce interval long enough that only the startup tick fires
        let a = spawn_node("aa:aa:aa:aa:aa:aa", Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let b_mac: MacAddr = "bb:bb:bb:bb:bb:bb".parse().unwrap();
        let (sa, mut remote) = tcp_pair().await;
        a.events
            .send(MeshEvent::LinkReady {
                mac: b_mac,
                stream: IoStream::Plain(sa),
            })
            .await
            .unwrap();

        // A frame claiming a foreign source must produce no wire traffic
        a.tap_in
            .send(TapFrame {
                src: "cc:cc:cc:cc:cc:cc".parse().unwrap(),
                dst: MacAddr::BROADCAST,
                payload: eth(b"\x08\x00forged"),
            })
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        assert!(
            timeout(SILENCE, remote.read(&mut buf)).await.is_err(),
            "forged frame reached the wire"
        );

        // A legitimate broadcast from the local MAC does go out
        a.tap_in
            .send(TapFrame {
                src: a.mac,
                dst: MacAddr::BROADCAST,
                payload: eth(b"\x08\x00genuine"),
            })
            .await
            .unwrap();

        let n = timeout(RECV_TIMEOUT, remote.read(&mut buf))
            .await
            .expect("genuine broadcast never reached the wire")
            .unwrap();
        assert!(n > 0);
    }
}
