//! Per-link read/write task.
//!
//! One task owns each established stream. It drains the link's outbound
//! queue in order and feeds decoded inbound frames to the controller; any
//! I/O or framing error ends the task, which reports the link as down.

use crate::controller::MeshEvent;
use crate::transport::IoStream;
use bytes::{Bytes, BytesMut};
use tapmesh_wire::{Frame, FrameDecoder, MacAddr};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Spawn the task driving one established link.
///
/// Returns the sending half of the link's outbound queue. Dropping it (or
/// the peer closing the stream) ends the task; the task emits
/// [`MeshEvent::LinkDown`] with `link_id` on the way out.
pub(crate) fn spawn_link(
    peer: MacAddr,
    link_id: u64,
    stream: IoStream,
    events: mpsc::Sender<MeshEvent>,
) -> mpsc::UnboundedSender<Bytes> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_link(peer, link_id, stream, rx, events));
    tx
}

async fn run_link(
    peer: MacAddr,
    link_id: u64,
    mut stream: IoStream,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::Sender<MeshEvent>,
) {
    let mut decoder = FrameDecoder::new();
    let mut read_buf = BytesMut::with_capacity(8 * 1024);

    'link: loop {
        tokio::select! {
            biased;

            maybe_frame = outbound.recv() => {
                match maybe_frame {
                    Some(frame_bytes) => {
                        if let Err(e) = stream.write_all(&frame_bytes).await {
                            info!("Write error on link to {}: {}", peer, e);
                            break 'link;
                        }
                    }
                    // Controller detached us
                    None => break 'link,
                }
            }

            read = tokio::io::AsyncReadExt::read_buf(&mut stream, &mut read_buf) => {
                match read {
                    Ok(0) => {
                        info!("Link to {} closed by peer", peer);
                        break 'link;
                    }
                    Ok(_) => loop {
                        match decoder.decode(&mut read_buf) {
                            Ok(Some((kind, payload))) => match Frame::parse(kind, payload) {
                                Ok(frame) => {
                                    let event = MeshEvent::FrameRx { peer, frame };
                                    if events.send(event).await.is_err() {
                                        break 'link;
                                    }
                                }
                                // Soft: the frame was well delimited, keep reading
                                Err(e) => debug!("Dropping bad frame from {}: {}", peer, e),
                            },
                            Ok(None) => break,
                            Err(e) => {
                                info!("Protocol error on link to {}: {}", peer, e);
                                break 'link;
                            }
                        }
                    },
                    Err(e) => {
                        info!("Read error on link to {}: {}", peer, e);
                        break 'link;
                    }
                }
            }
        }
    }

    let _ = events.send(MeshEvent::LinkDown { peer, link_id }).await;
}
