//! rawpath wire format: the per-packet Ethernet/IPv4/UDP frame header and
//! the packet header that embeds it.
//!
//! Every packet on the wire is `FrameHeader` + application metadata +
//! payload. The frame header is built once per peer (`RoutingInfo`) and
//! spliced into each packet's headroom on transmit; only the two length
//! fields change per packet.
//!
//! Checksums are never computed. The IPv4 and UDP checksum fields are zero
//! from allocation onwards and the network is configured to accept that, so
//! these types expose no setter for either field.
//!
//! All types are #[repr(C, packed)] with byte-array fields, so the layout is
//! exactly the on-wire layout and every multi-byte field is big-endian via
//! its accessor.

use std::fmt;
use std::net::Ipv4Addr;

use static_assertions::{assert_eq_size, const_assert_eq};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Sizes ─────────────────────────────────────────────────────────────────────

pub const ETH_HDR_SIZE: usize = 14;
pub const IPV4_HDR_SIZE: usize = 20;
pub const UDP_HDR_SIZE: usize = 8;

/// Ethernet + IPv4 + UDP.
pub const INET_HDRS_TOT_SIZE: usize = ETH_HDR_SIZE + IPV4_HDR_SIZE + UDP_HDR_SIZE;

/// Bytes of routing info copied into a packet's headroom on transmit.
/// Stops short of the UDP checksum, which is already zero.
pub const HDR_COPY_SIZE: usize = INET_HDRS_TOT_SIZE - 2;
const_assert_eq!(HDR_COPY_SIZE, 40);

/// Size of `PktHdr`: frame header plus 14 bytes of application metadata.
pub const PKTHDR_SIZE: usize = INET_HDRS_TOT_SIZE + 14;

/// Bytes of an inline send the NIC spends on the Ethernet header it keeps
/// in the descriptor itself.
pub const ETH_INLINE_HEADER_SIZE: usize = 18;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const IPPROTO_UDP: u8 = 17;
pub const IPV4_DEFAULT_TTL: u8 = 64;

/// Written into every packet header at allocation. A buffer whose first
/// header lacks it was never initialised.
pub const PKT_HDR_MAGIC: u8 = 11;

pub const MAX_MSG_SIZE: usize = (1 << 24) - 1;
pub const MAX_PKT_NUM: usize = (1 << 14) - 1;
pub const MAX_REQ_NUM: u64 = (1 << 44) - 1;

// ── Ethernet ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct EthHdr {
    dst_mac: [u8; 6],
    src_mac: [u8; 6],
    eth_type: [u8; 2],
}

assert_eq_size!(EthHdr, [u8; ETH_HDR_SIZE]);

impl EthHdr {
    pub fn new(src_mac: [u8; 6], dst_mac: [u8; 6]) -> Self {
        Self {
            dst_mac,
            src_mac,
            eth_type: ETHERTYPE_IPV4.to_be_bytes(),
        }
    }

    pub fn dst_mac(&self) -> [u8; 6] {
        self.dst_mac
    }

    pub fn src_mac(&self) -> [u8; 6] {
        self.src_mac
    }

    pub fn eth_type(&self) -> u16 {
        u16::from_be_bytes(self.eth_type)
    }
}

// ── IPv4 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct Ipv4Hdr {
    /// 0x45: version 4, 5-word header, no options.
    version_ihl: u8,
    tos: u8,
    tot_len: [u8; 2],
    id: [u8; 2],
    frag_off: [u8; 2],
    ttl: u8,
    protocol: u8,
    check: [u8; 2],
    src_ip: [u8; 4],
    dst_ip: [u8; 4],
}

assert_eq_size!(Ipv4Hdr, [u8; IPV4_HDR_SIZE]);

impl Ipv4Hdr {
    /// UDP-over-IPv4 header with zero length and zero checksum.
    pub fn new(src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> Self {
        Self {
            version_ihl: 0x45,
            tos: 0,
            tot_len: [0; 2],
            id: [0; 2],
            frag_off: [0; 2],
            ttl: IPV4_DEFAULT_TTL,
            protocol: IPPROTO_UDP,
            check: [0; 2],
            src_ip: src_ip.octets(),
            dst_ip: dst_ip.octets(),
        }
    }

    pub fn version(&self) -> u8 {
        self.version_ihl >> 4
    }

    pub fn ihl(&self) -> u8 {
        self.version_ihl & 0x0f
    }

    pub fn tot_len(&self) -> u16 {
        u16::from_be_bytes(self.tot_len)
    }

    pub fn set_tot_len(&mut self, len: u16) {
        self.tot_len = len.to_be_bytes();
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    pub fn check(&self) -> u16 {
        u16::from_be_bytes(self.check)
    }

    pub fn src_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src_ip)
    }

    pub fn dst_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst_ip)
    }

    pub fn set_dst_ip(&mut self, ip: Ipv4Addr) {
        self.dst_ip = ip.octets();
    }
}

// ── UDP ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct UdpHdr {
    src_port: [u8; 2],
    dst_port: [u8; 2],
    len: [u8; 2],
    check: [u8; 2],
}

assert_eq_size!(UdpHdr, [u8; UDP_HDR_SIZE]);

#[allow(clippy::len_without_is_empty)]
impl UdpHdr {
    pub fn new(src_port: u16, dst_port: u16) -> Self {
        Self {
            src_port: src_port.to_be_bytes(),
            dst_port: dst_port.to_be_bytes(),
            len: [0; 2],
            check: [0; 2],
        }
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes(self.src_port)
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes(self.dst_port)
    }

    pub fn len(&self) -> u16 {
        u16::from_be_bytes(self.len)
    }

    pub fn set_len(&mut self, len: u16) {
        self.len = len.to_be_bytes();
    }

    pub fn check(&self) -> u16 {
        u16::from_be_bytes(self.check)
    }
}

// ── Frame header ──────────────────────────────────────────────────────────────

/// Ethernet + IPv4 + UDP, contiguous, exactly as on the wire.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    pub eth: EthHdr,
    pub ipv4: Ipv4Hdr,
    pub udp: UdpHdr,
}

assert_eq_size!(FrameHeader, [u8; INET_HDRS_TOT_SIZE]);

impl FrameHeader {
    /// Set both length fields for a packet of `pkt_size` bytes, counted from
    /// the first byte of the Ethernet header.
    pub fn set_lengths(&mut self, pkt_size: usize) {
        debug_assert!(pkt_size >= INET_HDRS_TOT_SIZE && pkt_size <= u16::MAX as usize);
        self.ipv4.set_tot_len((pkt_size - ETH_HDR_SIZE) as u16);
        self.udp
            .set_len((pkt_size - ETH_HDR_SIZE - IPV4_HDR_SIZE) as u16);
    }

    /// Both checksum fields still hold their allocation-time zeroes.
    pub fn checksums_zero(&self) -> bool {
        self.ipv4.check() == 0 && self.udp.check() == 0
    }
}

impl fmt::Display for FrameHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[ETH: dst {}, src {}, eth_type 0x{:04x}], \
             [IPv4: version {}, ihl {}, tot_len {}, ttl {}, protocol {}, check {}, src {}, dst {}], \
             [UDP: src_port {}, dst_port {}, len {}, check {}]",
            MacDisplay(self.eth.dst_mac()),
            MacDisplay(self.eth.src_mac()),
            self.eth.eth_type(),
            self.ipv4.version(),
            self.ipv4.ihl(),
            self.ipv4.tot_len(),
            self.ipv4.ttl(),
            self.ipv4.protocol(),
            self.ipv4.check(),
            self.ipv4.src_ip(),
            self.ipv4.dst_ip(),
            self.udp.src_port(),
            self.udp.dst_port(),
            self.udp.len(),
            self.udp.check(),
        )
    }
}

struct MacDisplay([u8; 6]);

impl fmt::Display for MacDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

// ── Routing info ──────────────────────────────────────────────────────────────

/// One end of a raw-Ethernet UDP flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub mac: [u8; 6],
    pub ip: Ipv4Addr,
    pub udp_port: u16,
}

/// Prebuilt frame header for one remote peer, resolved once per session and
/// copied into every packet sent to that peer.
///
/// 8-byte aligned so the transmit copy of `HDR_COPY_SIZE` bytes is five
/// aligned words.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(8))]
pub struct RoutingInfo {
    frame: FrameHeader,
    _pad: [u8; 6],
}

assert_eq_size!(RoutingInfo, [u8; 48]);

impl RoutingInfo {
    pub fn new(local: &Endpoint, remote: &Endpoint) -> Self {
        Self {
            frame: FrameHeader {
                eth: EthHdr::new(local.mac, remote.mac),
                ipv4: Ipv4Hdr::new(local.ip, remote.ip),
                udp: UdpHdr::new(local.udp_port, remote.udp_port),
            },
            _pad: [0; 6],
        }
    }

    pub fn frame(&self) -> &FrameHeader {
        &self.frame
    }

    /// The bytes spliced into a packet's headroom on transmit.
    pub fn copy_bytes(&self) -> &[u8] {
        &self.frame.as_bytes()[..HDR_COPY_SIZE]
    }
}

// ── Packet type ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PktType {
    /// Request data.
    Req = 0,
    /// Request-for-response: the client pulls the next response packet.
    Rfr = 1,
    /// Explicit credit return.
    ExplCr = 2,
    /// Response data.
    Resp = 3,
}

impl TryFrom<u8> for PktType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PktType::Req),
            1 => Ok(PktType::Rfr),
            2 => Ok(PktType::ExplCr),
            3 => Ok(PktType::Resp),
            other => Err(WireError::UnknownPktType(other)),
        }
    }
}

impl fmt::Display for PktType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PktType::Req => "REQ",
            PktType::Rfr => "RFR",
            PktType::ExplCr => "CR",
            PktType::Resp => "RESP",
        };
        f.write_str(s)
    }
}

// ── Packet header ─────────────────────────────────────────────────────────────

/// Header stored in a message buffer's headroom ahead of each packet.
///
/// Wire size: 56 bytes.
///   bytes  0..42  frame header (written by the transmit path)
///   byte      42  request type
///   bytes 43..46  message size, 24-bit little-endian
///   bytes 46..48  destination session number, little-endian
///   bytes 48..50  packet type (low 2 bits) | packet number (high 14 bits)
///   bytes 50..56  request number (low 44 bits) | magic (high 4 bits)
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PktHdr {
    pub frame: FrameHeader,
    req_type: u8,
    msg_size: [u8; 3],
    dest_session_num: [u8; 2],
    pkt_type_num: [u8; 2],
    req_num_magic: [u8; 6],
}

assert_eq_size!(PktHdr, [u8; PKTHDR_SIZE]);

impl PktHdr {
    pub fn req_type(&self) -> u8 {
        self.req_type
    }

    pub fn set_req_type(&mut self, req_type: u8) {
        self.req_type = req_type;
    }

    pub fn msg_size(&self) -> usize {
        let [a, b, c] = self.msg_size;
        u32::from_le_bytes([a, b, c, 0]) as usize
    }

    pub fn set_msg_size(&mut self, size: usize) -> Result<(), WireError> {
        if size > MAX_MSG_SIZE {
            return Err(WireError::FieldOverflow("msg_size", size as u64));
        }
        let [a, b, c, _] = (size as u32).to_le_bytes();
        self.msg_size = [a, b, c];
        Ok(())
    }

    pub fn dest_session_num(&self) -> u16 {
        u16::from_le_bytes(self.dest_session_num)
    }

    pub fn set_dest_session_num(&mut self, num: u16) {
        self.dest_session_num = num.to_le_bytes();
    }

    pub fn pkt_type(&self) -> Result<PktType, WireError> {
        PktType::try_from((u16::from_le_bytes(self.pkt_type_num) & 0x3) as u8)
    }

    pub fn pkt_num(&self) -> usize {
        (u16::from_le_bytes(self.pkt_type_num) >> 2) as usize
    }

    pub fn set_pkt_type_num(&mut self, pkt_type: PktType, pkt_num: usize) -> Result<(), WireError> {
        if pkt_num > MAX_PKT_NUM {
            return Err(WireError::FieldOverflow("pkt_num", pkt_num as u64));
        }
        let packed = (pkt_num as u16) << 2 | pkt_type as u16;
        self.pkt_type_num = packed.to_le_bytes();
        Ok(())
    }

    fn req_num_magic_word(&self) -> u64 {
        let mut word = [0u8; 8];
        word[..6].copy_from_slice(&self.req_num_magic);
        u64::from_le_bytes(word)
    }

    fn set_req_num_magic_word(&mut self, word: u64) {
        self.req_num_magic.copy_from_slice(&word.to_le_bytes()[..6]);
    }

    pub fn req_num(&self) -> u64 {
        self.req_num_magic_word() & MAX_REQ_NUM
    }

    pub fn set_req_num(&mut self, req_num: u64) -> Result<(), WireError> {
        if req_num > MAX_REQ_NUM {
            return Err(WireError::FieldOverflow("req_num", req_num));
        }
        let word = (self.req_num_magic_word() & !MAX_REQ_NUM) | req_num;
        self.set_req_num_magic_word(word);
        Ok(())
    }

    pub fn magic(&self) -> u8 {
        (self.req_num_magic_word() >> 44) as u8 & 0x0f
    }

    pub fn set_magic(&mut self, magic: u8) {
        let word = (self.req_num_magic_word() & MAX_REQ_NUM) | (u64::from(magic & 0x0f) << 44);
        self.set_req_num_magic_word(word);
    }

    pub fn is_valid(&self) -> bool {
        self.magic() == PKT_HDR_MAGIC
    }
}

impl fmt::Display for PktHdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pkt_type() {
            Ok(t) => write!(f, "[type {t}")?,
            Err(_) => f.write_str("[type ?")?,
        }
        write!(
            f,
            ", dsn {}, reqn {}, pktn {}, msz {}, magic {}]",
            self.dest_session_num(),
            self.req_num(),
            self.pkt_num(),
            self.msg_size(),
            self.magic(),
        )
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown packet type: {0}")]
    UnknownPktType(u8),

    #[error("{0} value {1} does not fit its header field")]
    FieldOverflow(&'static str, u64),

    #[error("buffer of {0} bytes is too short for a frame header")]
    Truncated(usize),
}

/// Parse the frame header at the start of a received packet.
pub fn parse_frame_header(packet: &[u8]) -> Result<FrameHeader, WireError> {
    FrameHeader::read_from_prefix(packet).ok_or(WireError::Truncated(packet.len()))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
