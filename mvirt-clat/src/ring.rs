//! Memory-mapped `TPACKET_V2` receive ring on an `AF_PACKET` socket.
//!
//! The socket is bound to the uplink with `SOCK_DGRAM`, so every frame starts
//! at the IPv6 header. A classic BPF program drops everything not addressed
//! to the CLAT address before it reaches the ring.

use nix::libc;
use std::io;
use std::mem;
use std::net::Ipv6Addr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::MAX_MTU;

const PACKET_VERSION: libc::c_int = 10;
const PACKET_RX_RING: libc::c_int = 5;
const PACKET_LOSS: libc::c_int = 14;
const TPACKET_V2: libc::c_int = 1;

const TP_STATUS_KERNEL: u32 = 0;
const TP_STATUS_USER: u32 = 1;

const ETH_P_IPV6: u16 = 0x86dd;

/// `struct tpacket_req` from linux/if_packet.h
#[repr(C)]
#[allow(dead_code)]
struct TpacketReq {
    tp_block_size: libc::c_uint,
    tp_block_nr: libc::c_uint,
    tp_frame_size: libc::c_uint,
    tp_frame_nr: libc::c_uint,
}

/// `struct tpacket2_hdr` from linux/if_packet.h
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
#[allow(dead_code)]
struct Tpacket2Hdr {
    tp_status: u32,
    tp_len: u32,
    tp_snaplen: u32,
    tp_mac: u16,
    tp_net: u16,
    tp_sec: u32,
    tp_nsec: u32,
    tp_vlan_tci: u16,
    tp_vlan_tpid: u16,
    tp_padding: [u8; 4],
}

const fn tpacket_align(len: usize) -> usize {
    (len + 15) & !15
}

/// Frame header plus the link-layer address the kernel stores after it.
const TPACKET2_HDRLEN: usize =
    tpacket_align(mem::size_of::<Tpacket2Hdr>()) + mem::size_of::<libc::sockaddr_ll>();

pub const BLOCK_SIZE: usize = 65536;
pub const BLOCK_COUNT: usize = 16;
/// Room for a full-sized packet plus its `tun_pi` header.
pub const FRAME_SIZE: usize =
    tpacket_align(MAX_MTU as usize + 4) + tpacket_align(TPACKET2_HDRLEN) + 16;
pub const FRAMES_PER_BLOCK: usize = BLOCK_SIZE / FRAME_SIZE;
pub const RING_SIZE: usize = BLOCK_SIZE * BLOCK_COUNT;

// Classic BPF opcodes (linux/filter.h).
const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;

/// Offset of the destination address in an IPv6 header.
const IPV6_DST_OFFSET: u32 = 24;

#[derive(Debug, Error)]
pub enum RingError {
    #[error("failed to open packet socket: {0}")]
    Socket(#[source] io::Error),

    #[error("failed to set {name}: {source}")]
    SetOption {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to map packet ring: {0}")]
    Mmap(#[source] io::Error),

    #[error("failed to bind packet socket to ifindex {ifindex}: {source}")]
    Bind {
        ifindex: u32,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, RingError>;

fn insn(code: u16, jt: u8, jf: u8, k: u32) -> libc::sock_filter {
    libc::sock_filter { code, jt, jf, k }
}

/// BPF program accepting only IPv6 packets whose destination is `addr`.
///
/// ```text
///   [0] ld  [24]                 ; dst word 0
///   [1] jeq #w0  jt=0 jf=7
///   [2] ld  [28]
///   [3] jeq #w1  jt=0 jf=5
///   [4] ld  [32]
///   [5] jeq #w2  jt=0 jf=3
///   [6] ld  [36]
///   [7] jeq #w3  jt=0 jf=1
///   [8] ret #-1                  ; whole packet
///   [9] ret #0                   ; drop
/// ```
pub fn ipv6_destination_filter(addr: &Ipv6Addr) -> [libc::sock_filter; 10] {
    let octets = addr.octets();
    let word = |i: usize| {
        u32::from_be_bytes([octets[i * 4], octets[i * 4 + 1], octets[i * 4 + 2], octets[i * 4 + 3]])
    };

    [
        insn(BPF_LD | BPF_W | BPF_ABS, 0, 0, IPV6_DST_OFFSET),
        insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 7, word(0)),
        insn(BPF_LD | BPF_W | BPF_ABS, 0, 0, IPV6_DST_OFFSET + 4),
        insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 5, word(1)),
        insn(BPF_LD | BPF_W | BPF_ABS, 0, 0, IPV6_DST_OFFSET + 8),
        insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 3, word(2)),
        insn(BPF_LD | BPF_W | BPF_ABS, 0, 0, IPV6_DST_OFFSET + 12),
        insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 1, word(3)),
        insn(BPF_RET | BPF_K, 0, 0, u32::MAX),
        insn(BPF_RET | BPF_K, 0, 0, 0),
    ]
}

/// Position of the next frame to consume.
///
/// Frames never straddle blocks; the tail of each block is padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingCursor {
    block: usize,
    slot: usize,
}

impl RingCursor {
    /// Byte offset of the current frame from the start of the ring.
    pub fn offset(&self) -> usize {
        self.block * BLOCK_SIZE + self.slot * FRAME_SIZE
    }

    pub fn advance(&mut self) {
        self.slot += 1;
        if self.slot == FRAMES_PER_BLOCK {
            self.slot = 0;
            self.block = (self.block + 1) % BLOCK_COUNT;
        }
    }
}

/// Shared mapping of the ring, unmapped on drop.
struct RingMap {
    ptr: *mut u8,
    size: usize,
}

impl RingMap {
    fn map(fd: RawFd, size: usize) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_LOCKED | libc::MAP_POPULATE,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: ptr as *mut u8,
            size,
        })
    }

    #[cfg(test)]
    fn anonymous(size: usize) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: ptr as *mut u8,
            size,
        })
    }

    fn status(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset + FRAME_SIZE <= self.size);
        // tp_status is the first field of every frame and frames are 16-byte aligned.
        unsafe { &*(self.ptr.add(offset) as *const AtomicU32) }
    }

    fn header(&self, offset: usize) -> Tpacket2Hdr {
        unsafe { ptr::read_volatile(self.ptr.add(offset) as *const Tpacket2Hdr) }
    }

    fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.size);
        unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) }
    }
}

impl Drop for RingMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

/// Network-layer bytes of a frame, clamped to the frame.
fn frame_bounds(hdr: &Tpacket2Hdr) -> (usize, usize) {
    let end = (hdr.tp_net as usize + hdr.tp_snaplen as usize).min(FRAME_SIZE);
    let start = (hdr.tp_net as usize).min(end);
    (start, end)
}

/// The uplink packet ring.
pub struct PacketRing {
    fd: OwnedFd,
    map: RingMap,
    cursor: RingCursor,
}

fn set_option<T>(
    fd: RawFd,
    level: libc::c_int,
    name: &'static str,
    option: libc::c_int,
    value: &T,
) -> Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(RingError::SetOption {
            name,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

impl PacketRing {
    /// Open the ring on the interface `ifindex`. Nothing is accepted until a
    /// filter is installed with [`PacketRing::set_filter`].
    pub fn open(ifindex: u32) -> Result<Self> {
        let raw = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                ETH_P_IPV6.to_be() as libc::c_int,
            )
        };
        if raw < 0 {
            return Err(RingError::Socket(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // Reject everything until the real filter is attached.
        let drop_all = [insn(BPF_RET | BPF_K, 0, 0, 0)];
        attach_filter(raw, &drop_all)?;

        let on: libc::c_int = 1;
        set_option(raw, libc::SOL_PACKET, "PACKET_LOSS", PACKET_LOSS, &on)?;
        set_option(raw, libc::SOL_PACKET, "PACKET_VERSION", PACKET_VERSION, &TPACKET_V2)?;

        let req = TpacketReq {
            tp_block_size: BLOCK_SIZE as libc::c_uint,
            tp_block_nr: BLOCK_COUNT as libc::c_uint,
            tp_frame_size: FRAME_SIZE as libc::c_uint,
            tp_frame_nr: (FRAMES_PER_BLOCK * BLOCK_COUNT) as libc::c_uint,
        };
        set_option(raw, libc::SOL_PACKET, "PACKET_RX_RING", PACKET_RX_RING, &req)?;

        let map = RingMap::map(raw, RING_SIZE).map_err(RingError::Mmap)?;

        let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = ETH_P_IPV6.to_be();
        sll.sll_ifindex = ifindex as libc::c_int;
        sll.sll_pkttype = libc::PACKET_OTHERHOST as u8;
        let ret = unsafe {
            libc::bind(
                raw,
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(RingError::Bind {
                ifindex,
                source: io::Error::last_os_error(),
            });
        }

        info!(
            ifindex,
            blocks = BLOCK_COUNT,
            frames = FRAMES_PER_BLOCK * BLOCK_COUNT,
            frame_size = FRAME_SIZE,
            "Packet ring mapped"
        );

        Ok(Self {
            fd,
            map,
            cursor: RingCursor::default(),
        })
    }

    /// Capture only packets addressed to `addr`, replacing any earlier filter.
    pub fn set_filter(&self, addr: &Ipv6Addr) -> Result<()> {
        attach_filter(self.fd.as_raw_fd(), &ipv6_destination_filter(addr))?;
        debug!(%addr, "Ring filter attached");
        Ok(())
    }

    /// Consume and report a pending socket error after `POLLERR`.
    pub fn clear_error(&self) {
        let ret = unsafe { libc::recv(self.fd.as_raw_fd(), ptr::null_mut(), 0, libc::MSG_PEEK) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!(error = %err, "Packet ring socket error");
            }
        }
    }

    /// The frame at the cursor, if the kernel has handed it to us.
    pub fn next_frame(&mut self) -> Option<RingFrame<'_>> {
        let offset = self.cursor.offset();
        if self.map.status(offset).load(Ordering::Acquire) & TP_STATUS_USER == 0 {
            return None;
        }
        let (start, end) = frame_bounds(&self.map.header(offset));
        Some(RingFrame {
            ring: self,
            offset,
            start,
            end,
        })
    }

    pub fn cursor(&self) -> RingCursor {
        self.cursor
    }

    #[cfg(test)]
    fn from_parts(fd: OwnedFd, map: RingMap) -> Self {
        Self {
            fd,
            map,
            cursor: RingCursor::default(),
        }
    }
}

fn attach_filter(fd: RawFd, program: &[libc::sock_filter]) -> Result<()> {
    let fprog = libc::sock_fprog {
        len: program.len() as libc::c_ushort,
        filter: program.as_ptr() as *mut libc::sock_filter,
    };
    set_option(fd, libc::SOL_SOCKET, "SO_ATTACH_FILTER", libc::SO_ATTACH_FILTER, &fprog)
}

impl AsFd for PacketRing {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// A frame owned by userspace. Dropping it hands the slot back to the
/// kernel and moves the ring forward.
pub struct RingFrame<'a> {
    ring: &'a mut PacketRing,
    offset: usize,
    start: usize,
    end: usize,
}

impl RingFrame<'_> {
    /// The captured packet, starting at the IPv6 header.
    pub fn data(&self) -> &[u8] {
        self.ring
            .map
            .bytes(self.offset + self.start, self.end - self.start)
    }
}

impl Drop for RingFrame<'_> {
    fn drop(&mut self) {
        self.ring
            .map
            .status(self.offset)
            .store(TP_STATUS_KERNEL, Ordering::Release);
        self.ring.cursor.advance();
    }
}
