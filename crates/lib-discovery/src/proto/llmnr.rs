use std::{
    io::{self, Read, Write},
    net::{IpAddr, TcpStream},
    os::fd::FromRawFd,
    time::Duration,
};

use nix::sys::socket::{accept4, recvfrom, sendto, MsgFlags, SockFlag, SockaddrStorage};
use tracing::{debug, trace};

use crate::{
    endpoint::Endpoint,
    error::errno_io,
    iface::storage_ip,
    proto::HostIdentity,
    resolver::reply_source,
    service::{ServiceHandler, SocketKind},
};

const HEADER_LEN: usize = 12;
const FLAG_RESPONSE: u16 = 0x8000;
const OPCODE_MASK: u16 = 0x7800;
const CLASS_IN: u16 = 1;
const TTL: u32 = 30;
const STREAM_TIMEOUT: Duration = Duration::from_secs(2);

const QTYPE_A: u16 = 1;
const QTYPE_AAAA: u16 = 28;
const QTYPE_ANY: u16 = 255;

/// A parsed single-question LLMNR query.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Query {
    pub id: u16,
    pub qname: String,
    pub qtype: u16,
    /// Length of the question section, for echoing it back verbatim.
    pub question_len: usize,
}

/// Parse an LLMNR query. Responses, non-zero opcodes, multi-question
/// packets and compressed names are all dropped.
pub(crate) fn parse_query(buf: &[u8]) -> Option<Query> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let id = u16::from_be_bytes([buf[0], buf[1]]);
    let flags = u16::from_be_bytes([buf[2], buf[3]]);
    if flags & FLAG_RESPONSE != 0 || flags & OPCODE_MASK != 0 {
        return None;
    }
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
    let ancount = u16::from_be_bytes([buf[6], buf[7]]);
    if qdcount != 1 || ancount != 0 {
        return None;
    }

    let mut at = HEADER_LEN;
    let mut qname = String::new();
    loop {
        let len = *buf.get(at)? as usize;
        if len == 0 {
            at += 1;
            break;
        }
        // No compression in queries.
        if len & 0xc0 != 0 {
            return None;
        }
        let label = buf.get(at + 1..at + 1 + len)?;
        if !qname.is_empty() {
            qname.push('.');
        }
        qname.push_str(&String::from_utf8_lossy(label));
        at += 1 + len;
    }

    let qtype = u16::from_be_bytes([*buf.get(at)?, *buf.get(at + 1)?]);
    let qclass = u16::from_be_bytes([*buf.get(at + 2)?, *buf.get(at + 3)?]);
    if qclass != CLASS_IN {
        return None;
    }

    Some(Query {
        id,
        qname,
        qtype,
        question_len: at + 4 - HEADER_LEN,
    })
}

/// Build the response packet: echoed question, plus one address record when
/// we have an address to offer.
pub(crate) fn build_response(packet: &[u8], query: &Query, addr: Option<IpAddr>) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + query.question_len + 32);
    out.extend_from_slice(&query.id.to_be_bytes());
    out.extend_from_slice(&FLAG_RESPONSE.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&(addr.is_some() as u16).to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&packet[HEADER_LEN..HEADER_LEN + query.question_len]);

    if let Some(addr) = addr {
        // Compressed pointer back to the question name.
        out.extend_from_slice(&0xc00cu16.to_be_bytes());
        match addr {
            IpAddr::V4(v4) => {
                out.extend_from_slice(&QTYPE_A.to_be_bytes());
                out.extend_from_slice(&CLASS_IN.to_be_bytes());
                out.extend_from_slice(&TTL.to_be_bytes());
                out.extend_from_slice(&4u16.to_be_bytes());
                out.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                out.extend_from_slice(&QTYPE_AAAA.to_be_bytes());
                out.extend_from_slice(&CLASS_IN.to_be_bytes());
                out.extend_from_slice(&TTL.to_be_bytes());
                out.extend_from_slice(&16u16.to_be_bytes());
                out.extend_from_slice(&v6.octets());
            }
        }
    }

    out
}

/// Answers single-label name queries for this host.
pub struct LlmnrHandler {
    identity: HostIdentity,
}

impl LlmnrHandler {
    pub fn new(identity: HostIdentity) -> Self {
        LlmnrHandler { identity }
    }

    fn owns_name(&self, qname: &str) -> bool {
        qname.eq_ignore_ascii_case(&self.identity.hostname)
    }

    /// The address record to answer with, honoring the query type and the
    /// family of the asker.
    fn answer(&self, query: &Query, remote: IpAddr) -> Option<IpAddr> {
        let source = reply_source(remote, self.identity.ifindex).ok()?;
        match query.qtype {
            QTYPE_ANY => Some(source),
            QTYPE_A => Some(source).filter(IpAddr::is_ipv4),
            QTYPE_AAAA => Some(source).filter(IpAddr::is_ipv6),
            _ => None,
        }
    }

    fn reply_packet(&self, packet: &[u8], remote: IpAddr) -> Option<Vec<u8>> {
        let query = parse_query(packet)?;
        if !self.owns_name(&query.qname) {
            trace!(qname = %query.qname, "not our name");
            return None;
        }
        // Only address lookups get a packet; anything else stays silent.
        if !matches!(query.qtype, QTYPE_A | QTYPE_AAAA | QTYPE_ANY) {
            trace!(qname = %query.qname, qtype = query.qtype, "unsupported query type");
            return None;
        }
        debug!(qname = %query.qname, qtype = query.qtype, %remote, "answering query");
        Some(build_response(packet, &query, self.answer(&query, remote)))
    }

    fn recv_datagram(&self, ep: &mut Endpoint) -> io::Result<()> {
        let mut buf = [0u8; 1500];
        let (len, src) = recvfrom::<SockaddrStorage>(ep.raw_fd(), &mut buf).map_err(errno_io)?;
        let Some(src) = src else {
            return Ok(());
        };
        let Some(remote) = storage_ip(&src) else {
            return Ok(());
        };
        if let Some(reply) = self.reply_packet(&buf[..len], remote) {
            sendto(ep.raw_fd(), &reply, &src, MsgFlags::empty()).map_err(errno_io)?;
        }
        Ok(())
    }

    /// Accept one connection. Trouble on the accepted stream is that
    /// client's problem, not the listener's.
    fn recv_stream(&self, ep: &mut Endpoint) -> io::Result<()> {
        let fd = accept4(ep.raw_fd(), SockFlag::SOCK_CLOEXEC).map_err(errno_io)?;
        let stream = unsafe { TcpStream::from_raw_fd(fd) };
        if let Err(err) = self.serve_connection(stream) {
            debug!(%err, "tcp exchange failed");
        }
        Ok(())
    }

    fn serve_connection(&self, mut stream: TcpStream) -> io::Result<()> {
        stream.set_read_timeout(Some(STREAM_TIMEOUT))?;
        stream.set_write_timeout(Some(STREAM_TIMEOUT))?;
        let remote = stream.peer_addr()?.ip();

        // TCP framing: two-byte length prefix on both directions.
        let mut prefix = [0u8; 2];
        stream.read_exact(&mut prefix)?;
        let len = u16::from_be_bytes(prefix) as usize;
        if len == 0 || len > 1500 {
            return Ok(());
        }
        let mut packet = vec![0u8; len];
        stream.read_exact(&mut packet)?;

        if let Some(reply) = self.reply_packet(&packet, remote) {
            stream.write_all(&(reply.len() as u16).to_be_bytes())?;
            stream.write_all(&reply)?;
        }
        Ok(())
    }
}

impl ServiceHandler for LlmnrHandler {
    fn recv(&self, ep: &mut Endpoint) -> io::Result<()> {
        match ep.service.kind {
            SocketKind::Stream => self.recv_stream(ep),
            _ => self.recv_datagram(ep),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;
    use crate::proto::BootInfo;

    fn query_packet(name: &str, qtype: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0x1234u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        for label in name.split('.') {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
        buf.extend_from_slice(&qtype.to_be_bytes());
        buf.extend_from_slice(&CLASS_IN.to_be_bytes());
        buf
    }

    #[test]
    fn query_roundtrip() {
        let packet = query_packet("myhost", QTYPE_A);
        let query = parse_query(&packet).unwrap();
        assert_eq!(query.id, 0x1234);
        assert_eq!(query.qname, "myhost");
        assert_eq!(query.qtype, QTYPE_A);
        assert_eq!(query.question_len, packet.len() - HEADER_LEN);
    }

    #[test]
    fn responses_and_odd_packets_are_dropped() {
        // A response bit set.
        let mut packet = query_packet("myhost", QTYPE_A);
        packet[2] |= 0x80;
        assert_eq!(parse_query(&packet), None);

        // Two questions.
        let mut packet = query_packet("myhost", QTYPE_A);
        packet[5] = 2;
        assert_eq!(parse_query(&packet), None);

        // Truncated.
        let packet = query_packet("myhost", QTYPE_A);
        assert_eq!(parse_query(&packet[..8]), None);

        // Compression pointer in the name.
        let mut packet = query_packet("myhost", QTYPE_A);
        packet[HEADER_LEN] = 0xc0;
        assert_eq!(parse_query(&packet), None);
    }

    #[test]
    fn v4_answer_shape() {
        let packet = query_packet("myhost", QTYPE_A);
        let query = parse_query(&packet).unwrap();
        let reply = build_response(
            &packet,
            &query,
            Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))),
        );

        assert_eq!(&reply[0..2], &packet[0..2]);
        assert_eq!(u16::from_be_bytes([reply[2], reply[3]]), FLAG_RESPONSE);
        assert_eq!(u16::from_be_bytes([reply[6], reply[7]]), 1); // ancount
        let answer = &reply[HEADER_LEN + query.question_len..];
        assert_eq!(&answer[0..2], &[0xc0, 0x0c]);
        assert_eq!(u16::from_be_bytes([answer[2], answer[3]]), QTYPE_A);
        assert_eq!(&answer[10..14], &[192, 168, 1, 10]);
    }

    #[test]
    fn v6_answer_shape() {
        let packet = query_packet("myhost", QTYPE_AAAA);
        let query = parse_query(&packet).unwrap();
        let addr: Ipv6Addr = "fe80::1".parse().unwrap();
        let reply = build_response(&packet, &query, Some(IpAddr::V6(addr)));
        let answer = &reply[HEADER_LEN + query.question_len..];
        assert_eq!(u16::from_be_bytes([answer[2], answer[3]]), QTYPE_AAAA);
        assert_eq!(u16::from_be_bytes([answer[8], answer[9]]), 16);
        assert_eq!(&answer[10..26], &addr.octets());
    }

    #[test]
    fn empty_answer_keeps_question() {
        let packet = query_packet("myhost", QTYPE_A);
        let query = parse_query(&packet).unwrap();
        let reply = build_response(&packet, &query, None);
        assert_eq!(u16::from_be_bytes([reply[6], reply[7]]), 0);
        assert_eq!(reply.len(), HEADER_LEN + query.question_len);
    }

    fn handler() -> LlmnrHandler {
        let mut identity = HostIdentity::new(None, None, BootInfo::default(), None);
        identity.hostname = "myhost".into();
        LlmnrHandler::new(identity)
    }

    #[test]
    fn name_match_is_case_insensitive() {
        let handler = handler();
        assert!(handler.owns_name("MyHost"));
        assert!(handler.owns_name("MYHOST"));
        assert!(!handler.owns_name("otherhost"));
        assert!(!handler.owns_name("myhost.lan"));
    }

    #[test]
    fn unsupported_query_types_get_no_packet() {
        let handler = handler();
        let remote = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
        // NS, SOA, MX, TXT: name matches, but no packet goes out at all.
        for qtype in [2u16, 6, 15, 16] {
            let packet = query_packet("myhost", qtype);
            assert_eq!(handler.reply_packet(&packet, remote), None, "qtype {qtype}");
        }
        // The guard leaves address lookups alone.
        let packet = query_packet("myhost", QTYPE_A);
        assert!(handler.reply_packet(&packet, remote).is_some());
    }
}
