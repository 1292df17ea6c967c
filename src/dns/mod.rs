//! RFC1035 DNS query/response codec used for `DNS_QUERY`.
//!
//! Grounded on `dns.c`: a single in-flight A-record query per connection,
//! built and verified against a fixed packet buffer. Message-compression
//! pointers are followed when comparing/measuring names, capped at
//! [`MAX_COMPRESSION_JUMPS`] hops; the original C walks pointers with no
//! such cap; a crafted response with a pointer cycle would spin the real
//! adapter's firmware forever, which is merely wasteful on real hardware
//! but is a denial-of-service primitive in a library embedded into a
//! larger host, so this port bounds it.

use log::warn;

use crate::addr::Addr;
use crate::callbacks::{AddrType, Callbacks, SockType};

pub const PACKET_SIZE: usize = 512;
pub const DNS_PORT: u16 = 53;
const HEADER_SIZE: usize = 12;
const QD_SIZE: usize = 4;
const RR_SIZE: usize = 10;
const MAX_COMPRESSION_JUMPS: usize = 16;
const QTYPE_A: u16 = 1;

/// Outcome of polling a send-then-receive DNS exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPoll {
    Pending,
    Answer([u8; 4]),
    Error,
}

/// Per-adapter DNS state: just the monotonically increasing query id and a
/// scratch packet buffer, both grounded on `struct mobile_adapter_dns` /
/// `struct mobile_buffer_dns`.
pub struct Resolver {
    id: u16,
    buffer: [u8; PACKET_SIZE],
    size: usize,
}

impl Default for Resolver {
    fn default() -> Self {
        Resolver {
            id: 0,
            buffer: [0; PACKET_SIZE],
            size: 0,
        }
    }
}

/// Writes `name` (dot-separated ASCII labels, no trailing dot) as a
/// sequence of length-prefixed labels terminated by a zero byte, starting
/// at `*offset`. Grounded on `dns_make_name`.
fn make_name(buf: &mut [u8], offset: &mut usize, name: &[u8]) -> bool {
    let mut plen = *offset;
    let mut pdat = plen + 1;
    let mut count = 0usize;

    for &c in name {
        if pdat + 1 > buf.len() {
            return false;
        }
        if c == b'.' {
            buf[plen] = count as u8;
            count = 0;
            plen = pdat;
            pdat += 1;
        } else {
            if count >= 63 {
                return false;
            }
            buf[pdat] = c;
            pdat += 1;
            count += 1;
        }
    }
    if pdat + 1 > buf.len() {
        return false;
    }
    buf[plen] = count as u8;
    buf[pdat] = 0;
    *offset = pdat + 1;
    true
}

/// Compares the encoded name at `*offset` (following compression pointers)
/// against `name`, advancing `*offset` past the first (possibly
/// compressed) occurrence. Grounded on `dns_name_compare`.
fn name_compare(buf: &[u8], size: usize, offset: &mut usize, name: &[u8]) -> bool {
    if *offset + 1 > size || name.is_empty() {
        return false;
    }

    let mut pname = 0usize;
    let mut pcmp = *offset;
    let mut end: Option<usize> = None;
    let mut jumps = 0usize;

    loop {
        let b = buf[pcmp];
        if b == 0 {
            break;
        } else if b & 0xC0 == 0xC0 {
            if pcmp + 2 > size {
                return false;
            }
            if end.is_none() {
                end = Some(pcmp + 1);
            }
            jumps += 1;
            if jumps > MAX_COMPRESSION_JUMPS {
                warn!("dns: name compression exceeded {} jumps, rejecting", MAX_COMPRESSION_JUMPS);
                return false;
            }
            let off = ((b as usize & 0x3F) << 8) | buf[pcmp + 1] as usize;
            if off + 1 > size {
                return false;
            }
            pcmp = off;
        } else if b & 0xC0 == 0x00 {
            let len = b as usize;
            pcmp += 1;
            if pcmp + len + 1 > size {
                return false;
            }
            if pname != 0 {
                if name.get(pname) != Some(&b'.') {
                    return false;
                }
                pname += 1;
            }
            if pname + len > name.len() {
                return false;
            }
            for _ in 0..len {
                if buf[pcmp] != name[pname] {
                    return false;
                }
                pcmp += 1;
                pname += 1;
            }
        } else {
            return false;
        }
    }
    if pname != name.len() {
        return false;
    }

    *offset = end.unwrap_or(pcmp) + 1;
    true
}

/// Length in bytes of the (possibly compressed) name encoded at `offset`.
/// Grounded on `dns_name_len`.
fn name_len(buf: &[u8], size: usize, offset: usize) -> Option<usize> {
    if offset + 1 > size {
        return None;
    }
    let mut pcmp = offset;
    loop {
        let b = buf[pcmp];
        if b == 0 {
            break;
        } else if b & 0xC0 == 0xC0 {
            if pcmp + 2 > size {
                return None;
            }
            return Some(pcmp + 2 - offset);
        } else if b & 0xC0 == 0x00 {
            let len = b as usize;
            pcmp += 1;
            if pcmp + len + 1 > size {
                return None;
            }
            pcmp += len;
        } else {
            return None;
        }
    }
    Some(pcmp + 1 - offset)
}

/// Builds an A-record query with a fresh transaction id. Grounded on
/// `dns_make_query`.
fn make_query(buf: &mut [u8; PACKET_SIZE], id: u16, name: &[u8]) -> Option<usize> {
    buf[0] = (id >> 8) as u8;
    buf[1] = id as u8;
    buf[2..12].copy_from_slice(&[0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0]);

    let mut offset = HEADER_SIZE;
    if !make_name(buf, &mut offset, name) {
        return None;
    }
    if offset + QD_SIZE > PACKET_SIZE {
        return None;
    }
    buf[offset] = (QTYPE_A >> 8) as u8;
    buf[offset + 1] = QTYPE_A as u8;
    buf[offset + 2] = 0;
    buf[offset + 3] = 1;
    Some(offset + QD_SIZE)
}

/// Validates a received packet's header and question section against the
/// outstanding query, returning the answer count on success. Grounded on
/// `dns_verify_response`.
fn verify_response(buf: &[u8], size: usize, id: u16, name: &[u8], offset: &mut usize) -> Option<u16> {
    if size < HEADER_SIZE {
        return None;
    }
    if u16::from_be_bytes([buf[0], buf[1]]) != id {
        return None;
    }
    let flags = u16::from_be_bytes([buf[2], buf[3]]);
    if flags & 0xFB0F != 0x8100 {
        return None;
    }
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
    let ancount = u16::from_be_bytes([buf[6], buf[7]]);
    if qdcount != 1 || ancount < 1 {
        return None;
    }

    *offset = HEADER_SIZE;
    if !name_compare(buf, size, offset, name) {
        return None;
    }
    if *offset + QD_SIZE > size {
        return None;
    }
    if u16::from_be_bytes([buf[*offset], buf[*offset + 1]]) != QTYPE_A {
        return None;
    }
    if u16::from_be_bytes([buf[*offset + 2], buf[*offset + 3]]) != 1 {
        return None;
    }
    *offset += QD_SIZE;
    Some(ancount)
}

/// Reads one resource record at `*offset`, returning the byte index of its
/// rdata if it's a matching A record. Grounded on `dns_get_answer`.
fn get_answer(buf: &[u8], size: usize, name: &[u8], offset: &mut usize) -> Option<usize> {
    let rname_len = name_len(buf, size, *offset)?;
    if *offset + rname_len + RR_SIZE > size {
        return None;
    }
    let info = *offset + rname_len;
    let rdlength = u16::from_be_bytes([buf[info + 8], buf[info + 9]]) as usize;
    let rdata = *offset + rname_len + RR_SIZE;
    if rdata + rdlength > size {
        return None;
    }

    if !name_compare(buf, size, offset, name) {
        return None;
    }
    if u16::from_be_bytes([buf[info], buf[info + 1]]) != QTYPE_A {
        return None;
    }
    if u16::from_be_bytes([buf[info + 2], buf[info + 3]]) != 1 {
        return None;
    }
    if rdlength != 4 {
        return None;
    }

    *offset += RR_SIZE + rdlength;
    Some(rdata)
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends an A-record query for `host` over `conn`, opening it first if
    /// needed is the caller's responsibility. Grounded on
    /// `mobile_dns_request_send`.
    pub fn request_send<C: Callbacks>(&mut self, cb: &mut C, conn: usize, addr_send: &Addr, host: &[u8]) -> bool {
        self.id = self.id.wrapping_add(1);
        let Some(size) = make_query(&mut self.buffer, self.id, host) else {
            return false;
        };
        cb.sock_send(conn, &self.buffer[..size], Some(addr_send)) != crate::callbacks::SendOutcome::Error
    }

    /// Polls for the response, validating sender and packet contents.
    /// Grounded on `mobile_dns_request_recv`; on success each candidate
    /// answer record is checked in turn until one matches.
    pub fn request_recv<C: Callbacks>(&mut self, cb: &mut C, conn: usize, addr_send: &Addr, host: &[u8]) -> QueryPoll {
        let mut addr_recv = Addr::None;
        let recv = cb.sock_recv(conn, &mut self.buffer, Some(&mut addr_recv));
        let size = match recv {
            crate::callbacks::RecvOutcome::Data(n) => n,
            crate::callbacks::RecvOutcome::Empty | crate::callbacks::RecvOutcome::NoData => {
                return QueryPoll::Pending
            }
            crate::callbacks::RecvOutcome::Error | crate::callbacks::RecvOutcome::PeerClosed => {
                return QueryPoll::Error
            }
        };
        self.size = size;

        if &addr_recv != addr_send {
            return QueryPoll::Pending;
        }

        let mut offset = 0usize;
        let Some(mut ancount) = verify_response(&self.buffer, self.size, self.id, host, &mut offset) else {
            return QueryPoll::Error;
        };

        while ancount > 0 {
            ancount -= 1;
            match get_answer(&self.buffer, self.size, host, &mut offset) {
                Some(rdata) => {
                    let mut ip = [0u8; 4];
                    ip.copy_from_slice(&self.buffer[rdata..rdata + 4]);
                    return QueryPoll::Answer(ip);
                }
                None => continue,
            }
        }
        QueryPoll::Error
    }

    /// Opens the UDP socket used for the query. Separated from
    /// `request_send` so the command processor can retry with a different
    /// DNS server address without re-resolving a fresh query id.
    pub fn open<C: Callbacks>(&self, cb: &mut C, conn: usize, addr: &Addr) -> bool {
        let addr_ty = match addr {
            Addr::V6 { .. } => AddrType::Ipv6,
            _ => AddrType::Ipv4,
        };
        cb.sock_open(conn, SockType::Udp, addr_ty, 0)
    }
}
