//! Async TAP device endpoint for tapmesh.
//!
//! Opens the kernel virtual Ethernet interface, programs its hardware
//! address to the node identity, and moves whole Ethernet frames between the
//! kernel and the mesh controller.
//!
//! The device is opened without `IFF_NO_PI`, so every packet crosses the fd
//! with a 4-byte packet-info prefix followed by the 14-byte Ethernet header.
//! [`TapDevice::recv`] strips the prefix and the two address fields and
//! reports them separately; [`TapDevice::send`] reassembles the full frame.

#![warn(missing_docs)]
#![warn(clippy::all)]

use bytes::Bytes;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use tapmesh_wire::MacAddr;
use tokio::io::unix::AsyncFd;
use tracing::debug;

/// MTU assumed for the virtual interface.
pub const TAP_MTU: usize = 1500;

/// 4-byte `tun_pi` prefix present because the device is opened without
/// `IFF_NO_PI`.
const PACKET_INFO_LEN: usize = 4;
/// Destination plus source MAC at the front of every Ethernet frame.
const ETH_ADDR_LEN: usize = 12;

const IFNAMSIZ: usize = 16;
const IFF_TAP: i16 = 0x0002;
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const SIOCSIFHWADDR: libc::c_ulong = 0x8924;
const ARPHRD_ETHER: u16 = 1;

// struct ifreq is 40 bytes on 64-bit Linux; the kernel copies the whole
// struct, so the variants below are padded to full size.
#[repr(C)]
struct IfreqFlags {
    ifr_name: [u8; IFNAMSIZ],
    ifr_flags: i16,
    pad: [u8; 22],
}

#[repr(C)]
struct IfreqHwaddr {
    ifr_name: [u8; IFNAMSIZ],
    sa_family: u16,
    sa_data: [u8; 14],
    pad: [u8; 8],
}

/// One Ethernet frame crossing the TAP boundary
///
/// `payload` starts at the EtherType; the address fields travel separately
/// because both directions of the mesh pump need them before anything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapFrame {
    /// Source hardware address
    pub src: MacAddr,
    /// Destination hardware address
    pub dst: MacAddr,
    /// Frame contents from the EtherType onward
    pub payload: Bytes,
}

/// An open TAP interface registered with the tokio reactor
#[derive(Debug)]
pub struct TapDevice {
    fd: AsyncFd<File>,
    name: String,
}

impl TapDevice {
    /// Open a TAP interface using `name_template` (e.g. `tapmesh%d`).
    ///
    /// The kernel replaces `%d` with the first free index; the resolved name
    /// is available via [`TapDevice::name`]. Requires `CAP_NET_ADMIN`.
    pub fn open(name_template: &str) -> io::Result<TapDevice> {
        if name_template.len() >= IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interface name template too long",
            ));
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")?;

        let mut req = IfreqFlags {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: IFF_TAP,
            pad: [0; 22],
        };
        req.ifr_name[..name_template.len()].copy_from_slice(name_template.as_bytes());

        // SAFETY: valid fd and a properly sized, initialised ifreq.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &mut req) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let name_len = req.ifr_name.iter().position(|&b| b == 0).unwrap_or(IFNAMSIZ);
        let name = String::from_utf8_lossy(&req.ifr_name[..name_len]).into_owned();

        Ok(TapDevice {
            fd: AsyncFd::new(file)?,
            name,
        })
    }

    /// The resolved interface name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Program the interface hardware address to `mac`.
    pub fn set_mac(&self, mac: MacAddr) -> io::Result<()> {
        let mut req = IfreqHwaddr {
            ifr_name: [0; IFNAMSIZ],
            sa_family: ARPHRD_ETHER,
            sa_data: [0; 14],
            pad: [0; 8],
        };
        req.ifr_name[..self.name.len()].copy_from_slice(self.name.as_bytes());
        req.sa_data[..6].copy_from_slice(mac.as_bytes());

        // The hardware-address ioctl goes through a control socket, not the
        // tun fd.
        // SAFETY: FFI calls with a checked socket fd and an initialised ifreq.
        unsafe {
            let sock = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
            if sock < 0 {
                return Err(io::Error::last_os_error());
            }
            let rc = libc::ioctl(sock, SIOCSIFHWADDR, &mut req);
            let err = io::Error::last_os_error();
            libc::close(sock);
            if rc < 0 {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Read the next Ethernet frame from the kernel.
    ///
    /// Runt packets are skipped with a debug log.
    pub async fn recv(&self) -> io::Result<TapFrame> {
        let mut buf = [0u8; PACKET_INFO_LEN + ETH_ADDR_LEN + 2 + TAP_MTU + 64];
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| (&*inner.get_ref()).read(&mut buf)) {
                Ok(Ok(n)) => match parse_tap_packet(&buf[..n]) {
                    Some(frame) => return Ok(frame),
                    None => {
                        debug!("Dropping runt tap packet ({} bytes)", n);
                        continue;
                    }
                },
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    /// Write one Ethernet frame to the kernel.
    pub async fn send(&self, frame: &TapFrame) -> io::Result<()> {
        let packet = build_tap_packet(frame);
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| (&*inner.get_ref()).write(&packet)) {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }
}

/// Split a raw tap packet into its frame parts.
///
/// Layout: `tun_pi:4 | dst:6 | src:6 | ethertype+payload`. Returns `None`
/// for packets too short to carry both addresses.
fn parse_tap_packet(buf: &[u8]) -> Option<TapFrame> {
    if buf.len() < PACKET_INFO_LEN + ETH_ADDR_LEN {
        return None;
    }
    let eth = &buf[PACKET_INFO_LEN..];
    let dst = MacAddr::from_slice(&eth[..6])?;
    let src = MacAddr::from_slice(&eth[6..12])?;
    Some(TapFrame {
        src,
        dst,
        payload: Bytes::copy_from_slice(&eth[12..]),
    })
}

/// Reassemble a raw tap packet from frame parts.
///
/// The packet-info proto field repeats the EtherType so the kernel tags the
/// skb correctly.
fn build_tap_packet(frame: &TapFrame) -> Vec<u8> {
    let mut packet = Vec::with_capacity(PACKET_INFO_LEN + ETH_ADDR_LEN + frame.payload.len());
    let proto: [u8; 2] = match frame.payload.get(..2) {
        Some(ethertype) => [ethertype[0], ethertype[1]],
        None => [0, 0],
    };
    packet.extend_from_slice(&[0, 0]); // tun_pi.flags
    packet.extend_from_slice(&proto); // tun_pi.proto
    packet.extend_from_slice(frame.dst.as_bytes());
    packet.extend_from_slice(frame.src.as_bytes());
    packet.extend_from_slice(&frame.payload);
    packet
}
