//! Message framing for the tapmesh wire protocol.
//!
//! Frames ride an authenticated TLS stream as a `u16` big-endian length
//! followed by a kind tag and a kind-specific payload. The decoder is
//! incremental: it consumes complete frames from a growable buffer and asks
//! for more bytes otherwise.

use crate::error::WireError;
use crate::mac::MacAddr;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Protocol version carried in announce frames
pub const PROTOCOL_VERSION: u8 = 1;

/// Kind tag for announce frames (route advertisement)
pub const KIND_ANNOUNCE: u8 = 0x00;
/// Kind tag for unicast frames (routed Ethernet payload)
pub const KIND_UNICAST: u8 = 0x80;
/// Kind tag for broadcast frames (flooded Ethernet payload)
pub const KIND_BROADCAST: u8 = 0x81;

/// Upper bound on `kind | payload` for one frame.
///
/// Must cover a full-MTU Ethernet payload (1500 bytes) plus the 14 header
/// bytes and the 15-byte broadcast prefix, with headroom.
pub const MAX_FRAME: usize = 2048;

/// A decoded protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Route advertisement flooded through the mesh
    Announce {
        /// Protocol version of the sender (must be [`PROTOCOL_VERSION`])
        version: u8,
        /// Freshness stamp, strictly increasing per origin
        stamp: i64,
        /// MAC of the node the announce advertises
        origin: MacAddr,
    },
    /// Ethernet payload routed to a single destination
    Unicast {
        /// Destination MAC
        dst: MacAddr,
        /// Source MAC (the originating node)
        src: MacAddr,
        /// Ethernet frame from the EtherType onward
        payload: Bytes,
    },
    /// Ethernet payload flooded to every node
    Broadcast {
        /// Broadcast id, strictly increasing per source
        stamp: i64,
        /// Source MAC (the originating node)
        src: MacAddr,
        /// Ethernet frame from the EtherType onward
        payload: Bytes,
    },
}

impl Frame {
    /// Build an announce frame for `origin` at the current protocol version.
    pub fn announce(stamp: i64, origin: MacAddr) -> Frame {
        Frame::Announce {
            version: PROTOCOL_VERSION,
            stamp,
            origin,
        }
    }

    /// The wire kind tag of this frame.
    pub fn kind(&self) -> u8 {
        match self {
            Frame::Announce { .. } => KIND_ANNOUNCE,
            Frame::Unicast { .. } => KIND_UNICAST,
            Frame::Broadcast { .. } => KIND_BROADCAST,
        }
    }

    /// Encode as a complete length-prefixed wire frame.
    ///
    /// Fails when `kind | payload` would exceed [`MAX_FRAME`].
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut body = BytesMut::with_capacity(64);
        body.put_u8(self.kind());

        match self {
            Frame::Announce {
                version,
                stamp,
                origin,
            } => {
                body.put_u8(*version);
                body.put_i64(*stamp);
                body.put_slice(origin.as_bytes());
            }
            Frame::Unicast { dst, src, payload } => {
                body.put_slice(dst.as_bytes());
                body.put_slice(src.as_bytes());
                body.put_slice(payload);
            }
            Frame::Broadcast {
                stamp,
                src,
                payload,
            } => {
                body.put_i64(*stamp);
                body.put_slice(src.as_bytes());
                body.put_slice(payload);
            }
        }

        if body.len() > MAX_FRAME {
            return Err(WireError::Size(body.len()));
        }

        let mut buf = BytesMut::with_capacity(2 + body.len());
        buf.put_u16(body.len() as u16);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Parse the payload of an already-delimited frame.
    ///
    /// Errors here are per-frame: the framing is intact and the caller may
    /// drop the frame and keep reading the stream.
    pub fn parse(kind: u8, mut payload: Bytes) -> Result<Frame, WireError> {
        let truncated = |len| WireError::Truncated { kind, len };

        match kind {
            KIND_ANNOUNCE => {
                if payload.len() < 15 {
                    return Err(truncated(payload.len()));
                }
                let version = payload.get_u8();
                let stamp = payload.get_i64();
                let origin = get_mac(&mut payload);
                Ok(Frame::Announce {
                    version,
                    stamp,
                    origin,
                })
            }
            KIND_UNICAST => {
                if payload.len() < 12 {
                    return Err(truncated(payload.len()));
                }
                let dst = get_mac(&mut payload);
                let src = get_mac(&mut payload);
                Ok(Frame::Unicast {
                    dst,
                    src,
                    payload,
                })
            }
            KIND_BROADCAST => {
                if payload.len() < 14 {
                    return Err(truncated(payload.len()));
                }
                let stamp = payload.get_i64();
                let src = get_mac(&mut payload);
                Ok(Frame::Broadcast {
                    stamp,
                    src,
                    payload,
                })
            }
            other => Err(WireError::Kind(other)),
        }
    }
}

// Length is checked by the caller.
fn get_mac(buf: &mut Bytes) -> MacAddr {
    let mut octets = [0u8; 6];
    buf.copy_to_slice(&mut octets);
    MacAddr::new(octets)
}

/// Incremental decoder for length-prefixed frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame: usize,
}

impl FrameDecoder {
    /// Create a decoder with the default frame limit.
    pub fn new() -> Self {
        Self {
            max_frame: MAX_FRAME,
        }
    }

    /// Split one `(kind, payload)` off the front of the buffer.
    ///
    /// Returns `Ok(None)` until a complete frame is buffered. A length above
    /// the frame limit or a zero-length frame is fatal; the caller must drop
    /// the stream.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<(u8, Bytes)>, WireError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let frame_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if frame_len > self.max_frame {
            return Err(WireError::Size(frame_len));
        }
        if frame_len == 0 {
            return Err(WireError::Malformed);
        }

        if buf.len() < 2 + frame_len {
            return Ok(None);
        }

        buf.advance(2);
        let mut body = buf.split_to(frame_len).freeze();
        let kind = body.get_u8();
        Ok(Some((kind, body)))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(s: &str) -> MacAddr {
        s.parse().unwrap()
    }

    fn decode_one(bytes: &Bytes) -> Frame {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(bytes.as_ref());
        let (kind, payload) = decoder.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty(), "decoder left trailing bytes");
        Frame::parse(kind, payload).unwrap()
    }

    #[test]
    fn test_announce_roundtrip() {
        let frame = Frame::announce(1234567890, mac("aa:bb:cc:dd:ee:ff"));
        let encoded = frame.encode().unwrap();

        // length prefix covers kind + version + stamp + mac
        assert_eq!(encoded.len(), 2 + 1 + 1 + 8 + 6);
        assert_eq!(&encoded[..2], &[0x00, 0x10]);
        assert_eq!(encoded[2], KIND_ANNOUNCE);

        assert_eq!(decode_one(&encoded), frame);
    }

    #[test]
    fn test_unicast_roundtrip() {
        let frame = Frame::Unicast {
            dst: mac("bb:bb:bb:bb:bb:bb"),
            src: mac("aa:aa:aa:aa:aa:aa"),
            payload: Bytes::from_static(b"\x08\x00hello"),
        };
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded[2], KIND_UNICAST);
        assert_eq!(decode_one(&encoded), frame);
    }

    #[test]
    fn test_broadcast_roundtrip() {
        let frame = Frame::Broadcast {
            stamp: i64::MAX,
            src: mac("aa:aa:aa:aa:aa:aa"),
            payload: Bytes::from_static(b"\x08\x06arp"),
        };
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded[2], KIND_BROADCAST);
        assert_eq!(decode_one(&encoded), frame);
    }

    #[test]
    fn test_incremental_decode() {
        let frame = Frame::announce(42, mac("aa:bb:cc:dd:ee:ff"));
        let encoded = frame.encode().unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();

        // Feed the frame one byte at a time; only the last byte completes it
        for (i, byte) in encoded.iter().enumerate() {
            buf.put_u8(*byte);
            let result = decoder.decode(&mut buf).unwrap();
            if i + 1 < encoded.len() {
                assert!(result.is_none());
            } else {
                let (kind, payload) = result.unwrap();
                assert_eq!(Frame::parse(kind, payload).unwrap(), frame);
            }
        }
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let first = Frame::announce(1, mac("aa:bb:cc:dd:ee:ff"));
        let second = Frame::announce(2, mac("aa:bb:cc:dd:ee:ff"));

        let mut buf = BytesMut::new();
        buf.put_slice(&first.encode().unwrap());
        buf.put_slice(&second.encode().unwrap());

        let mut decoder = FrameDecoder::new();
        let (kind, payload) = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(Frame::parse(kind, payload).unwrap(), first);
        let (kind, payload) = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(Frame::parse(kind, payload).unwrap(), second);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_max_frame_boundary() {
        let mut decoder = FrameDecoder::new();

        // Exactly MAX_FRAME decodes
        let mut buf = BytesMut::new();
        buf.put_u16(MAX_FRAME as u16);
        buf.put_u8(KIND_UNICAST);
        buf.put_slice(&vec![0u8; MAX_FRAME - 1]);
        let (kind, payload) = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(kind, KIND_UNICAST);
        assert_eq!(payload.len(), MAX_FRAME - 1);

        // MAX_FRAME + 1 is rejected before the body arrives
        let mut buf = BytesMut::new();
        buf.put_u16((MAX_FRAME + 1) as u16);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WireError::Size(len)) if len == MAX_FRAME + 1
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_body() {
        let frame = Frame::Unicast {
            dst: mac("bb:bb:bb:bb:bb:bb"),
            src: mac("aa:aa:aa:aa:aa:aa"),
            payload: Bytes::from(vec![0u8; MAX_FRAME]),
        };
        // kind + addresses push the body past the limit
        assert!(matches!(
            frame.encode(),
            Err(WireError::Size(len)) if len == 1 + 12 + MAX_FRAME
        ));
    }

    #[test]
    fn test_zero_length_frame_is_malformed() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&[0u8, 0u8][..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WireError::Malformed)
        ));
    }

    #[test]
    fn test_unknown_kind() {
        let err = Frame::parse(0x7f, Bytes::from_static(&[0u8; 32])).unwrap_err();
        assert!(matches!(err, WireError::Kind(0x7f)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_truncated_payloads() {
        // One byte short of each minimum
        for (kind, min_len) in [(KIND_ANNOUNCE, 15), (KIND_UNICAST, 12), (KIND_BROADCAST, 14)] {
            let payload = Bytes::from(vec![0u8; min_len - 1]);
            let err = Frame::parse(kind, payload).unwrap_err();
            assert!(matches!(err, WireError::Truncated { .. }), "kind {kind:#04x}");
            assert!(!err.is_fatal());
        }
    }

    #[test]
    fn test_fatal_classification() {
        assert!(WireError::Size(65535).is_fatal());
        assert!(WireError::Malformed.is_fatal());
        assert!(!WireError::Kind(0x42).is_fatal());
    }
}
