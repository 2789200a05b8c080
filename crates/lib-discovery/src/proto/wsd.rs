use std::{
    cell::Cell,
    fs,
    io::{self, Read, Write},
    net::{IpAddr, TcpStream},
    os::fd::FromRawFd,
    time::{Duration, SystemTime, UNIX_EPOCH},
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

const ACTION_PROBE: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe";
const ACTION_RESOLVE: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery/Resolve";
const ACTION_GET: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Get";
const ACTION_HELLO: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery/Hello";
const ACTION_BYE: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery/Bye";
const ACTION_PROBE_MATCHES: &str =
    "http://schemas.xmlsoap.org/ws/2005/04/discovery/ProbeMatches";
const ACTION_RESOLVE_MATCHES: &str =
    "http://schemas.xmlsoap.org/ws/2005/04/discovery/ResolveMatches";
const ACTION_GET_RESPONSE: &str =
    "http://schemas.xmlsoap.org/ws/2004/09/transfer/GetResponse";

const TO_DISCOVERY: &str = "urn:schemas-xmlsoap-org:ws:2005:04:discovery";
const TO_ANONYMOUS: &str =
    "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

const DATAGRAM_BUF: usize = 8192;
const STREAM_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_REQUEST: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WsdAction {
    Probe,
    Resolve,
    Get,
}

/// Classify an inbound SOAP message by its action URI. Exact comparison,
/// so a stray ProbeMatches never reads as a Probe.
pub(crate) fn classify(body: &str) -> Option<WsdAction> {
    match element_text(body, "Action")? {
        ACTION_PROBE => Some(WsdAction::Probe),
        ACTION_RESOLVE => Some(WsdAction::Resolve),
        ACTION_GET => Some(WsdAction::Get),
        _ => None,
    }
}

/// Text content of the first element with this local name, prefix-agnostic.
pub(crate) fn element_text<'a>(xml: &'a str, local_name: &str) -> Option<&'a str> {
    let at = xml.find(local_name)?;
    let rest = &xml[at..];
    let open = rest.find('>')?;
    let rest = &rest[open + 1..];
    let close = rest.find('<')?;
    Some(rest[..close].trim())
}

fn random_uuid() -> String {
    let mut bytes: [u8; 16] = rand::random();
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let mut out = String::with_capacity(36);
    for (i, b) in bytes.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Stable device identity: the machine id when the host offers one, a
/// random one otherwise.
fn device_uuid() -> String {
    if let Ok(id) = fs::read_to_string("/etc/machine-id") {
        let id = id.trim();
        if id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return format!(
                "{}-{}-{}-{}-{}",
                &id[0..8],
                &id[8..12],
                &id[12..16],
                &id[16..20],
                &id[20..32]
            );
        }
    }
    random_uuid()
}

/// Answers WS-Discovery probes and resolves, and serves device metadata
/// over the companion HTTP listener.
pub struct WsdHandler {
    identity: HostIdentity,
    uuid: String,
    instance_id: u64,
    message_no: Cell<u64>,
}

impl WsdHandler {
    pub fn new(identity: HostIdentity) -> Self {
        let instance_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(1);
        WsdHandler {
            identity,
            uuid: device_uuid(),
            instance_id,
            message_no: Cell::new(0),
        }
    }

    pub fn endpoint_uuid(&self) -> &str {
        &self.uuid
    }

    fn envelope(&self, action: &str, to: &str, relates: Option<&str>, body: &str) -> String {
        let message_no = self.message_no.get() + 1;
        self.message_no.set(message_no);
        let relates = relates
            .map(|id| format!("<wsa:RelatesTo>{id}</wsa:RelatesTo>"))
            .unwrap_or_default();
        format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
             <soap:Envelope \
             xmlns:soap=\"http://www.w3.org/2003/05/soap-envelope\" \
             xmlns:wsa=\"http://schemas.xmlsoap.org/ws/2004/08/addressing\" \
             xmlns:wsd=\"http://schemas.xmlsoap.org/ws/2005/04/discovery\" \
             xmlns:wsx=\"http://schemas.xmlsoap.org/ws/2004/09/mex\" \
             xmlns:wsdp=\"http://schemas.xmlsoap.org/ws/2006/02/devprof\" \
             xmlns:pnpx=\"http://schemas.microsoft.com/windows/pnpx/2005/10\" \
             xmlns:pub=\"http://schemas.microsoft.com/windows/pub/2005/07\">\
             <soap:Header>\
             <wsa:To>{to}</wsa:To>\
             <wsa:Action>{action}</wsa:Action>\
             <wsa:MessageID>urn:uuid:{message_id}</wsa:MessageID>\
             {relates}\
             <wsd:AppSequence InstanceId=\"{instance}\" MessageNumber=\"{message_no}\"/>\
             </soap:Header>\
             <soap:Body>{body}</soap:Body>\
             </soap:Envelope>",
            to = to,
            action = action,
            message_id = random_uuid(),
            relates = relates,
            instance = self.instance_id,
            message_no = message_no,
        )
    }

    fn endpoint_reference(&self) -> String {
        format!(
            "<wsa:EndpointReference><wsa:Address>urn:uuid:{}</wsa:Address></wsa:EndpointReference>",
            self.uuid
        )
    }

    fn xaddrs(&self, ip: IpAddr, port: u16) -> String {
        match ip {
            IpAddr::V4(v4) => format!("http://{v4}:{port}/{}", self.uuid),
            IpAddr::V6(v6) => format!("http://[{v6}]:{port}/{}", self.uuid),
        }
    }

    fn hello(&self, xaddrs: &str) -> String {
        let body = format!(
            "<wsd:Hello>{}<wsd:Types>wsdp:Device pnpx:ComputerDevice</wsd:Types>\
             <wsd:XAddrs>{xaddrs}</wsd:XAddrs>\
             <wsd:MetadataVersion>1</wsd:MetadataVersion></wsd:Hello>",
            self.endpoint_reference()
        );
        self.envelope(ACTION_HELLO, TO_DISCOVERY, None, &body)
    }

    fn bye(&self) -> String {
        let body = format!("<wsd:Bye>{}</wsd:Bye>", self.endpoint_reference());
        self.envelope(ACTION_BYE, TO_DISCOVERY, None, &body)
    }

    fn probe_matches(&self, relates: Option<&str>, xaddrs: &str) -> String {
        let body = format!(
            "<wsd:ProbeMatches><wsd:ProbeMatch>{}\
             <wsd:Types>wsdp:Device pnpx:ComputerDevice</wsd:Types>\
             <wsd:XAddrs>{xaddrs}</wsd:XAddrs>\
             <wsd:MetadataVersion>1</wsd:MetadataVersion>\
             </wsd:ProbeMatch></wsd:ProbeMatches>",
            self.endpoint_reference()
        );
        self.envelope(ACTION_PROBE_MATCHES, TO_ANONYMOUS, relates, &body)
    }

    fn resolve_matches(&self, relates: Option<&str>, xaddrs: &str) -> String {
        let body = format!(
            "<wsd:ResolveMatches><wsd:ResolveMatch>{}\
             <wsd:Types>wsdp:Device pnpx:ComputerDevice</wsd:Types>\
             <wsd:XAddrs>{xaddrs}</wsd:XAddrs>\
             <wsd:MetadataVersion>1</wsd:MetadataVersion>\
             </wsd:ResolveMatch></wsd:ResolveMatches>",
            self.endpoint_reference()
        );
        self.envelope(ACTION_RESOLVE_MATCHES, TO_ANONYMOUS, relates, &body)
    }

    /// The transfer Get reply: device and model sections plus the host
    /// relationship Windows uses to file the machine under its workgroup.
    fn metadata(&self, relates: Option<&str>) -> String {
        let boot = &self.identity.boot;
        let body = format!(
            "<wsx:Metadata>\
             <wsx:MetadataSection Dialect=\"http://schemas.xmlsoap.org/ws/2006/02/devprof/ThisDevice\">\
             <wsdp:ThisDevice>\
             <wsdp:FriendlyName>{name}</wsdp:FriendlyName>\
             <wsdp:FirmwareVersion>{firmware}</wsdp:FirmwareVersion>\
             <wsdp:SerialNumber>{serial}</wsdp:SerialNumber>\
             </wsdp:ThisDevice>\
             </wsx:MetadataSection>\
             <wsx:MetadataSection Dialect=\"http://schemas.xmlsoap.org/ws/2006/02/devprof/ThisModel\">\
             <wsdp:ThisModel>\
             <wsdp:Manufacturer>{vendor}</wsdp:Manufacturer>\
             <wsdp:ModelName>{model}</wsdp:ModelName>\
             <pnpx:DeviceCategory>Computers</pnpx:DeviceCategory>\
             </wsdp:ThisModel>\
             </wsx:MetadataSection>\
             <wsx:MetadataSection Dialect=\"http://schemas.xmlsoap.org/ws/2006/02/devprof/Relationship\">\
             <wsdp:Relationship Type=\"http://schemas.xmlsoap.org/ws/2006/02/devprof/host\">\
             <wsdp:Host>{reference}\
             <wsdp:Types>pub:Computer</wsdp:Types>\
             <wsdp:ServiceId>urn:uuid:{uuid}</wsdp:ServiceId>\
             <pub:Computer>{name}/Workgroup:{workgroup}</pub:Computer>\
             </wsdp:Host>\
             </wsdp:Relationship>\
             </wsx:MetadataSection>\
             </wsx:Metadata>",
            name = self.identity.netbios_name,
            firmware = boot.sku.as_deref().unwrap_or("1.0"),
            serial = boot.serial.as_deref().unwrap_or("-"),
            vendor = boot.vendor.as_deref().unwrap_or("wsddr"),
            model = boot.model.as_deref().unwrap_or("Computer"),
            reference = self.endpoint_reference(),
            uuid = self.uuid,
            workgroup = self.identity.workgroup,
        );
        self.envelope(ACTION_GET_RESPONSE, TO_ANONYMOUS, relates, &body)
    }

    /// Reply-from address for a remote asker, falling back to the address
    /// the endpoint was built on.
    fn source_for(&self, remote: IpAddr, ep: &Endpoint) -> Option<IpAddr> {
        reply_source(remote, self.identity.ifindex)
            .ok()
            .or(ep.ifaddr)
    }

    fn recv_datagram(&self, ep: &mut Endpoint) -> io::Result<()> {
        let mut buf = vec![0u8; DATAGRAM_BUF];
        let (len, src) = recvfrom::<SockaddrStorage>(ep.raw_fd(), &mut buf).map_err(errno_io)?;
        let Some(src) = src else {
            return Ok(());
        };
        let Some(remote) = storage_ip(&src) else {
            return Ok(());
        };
        let body = String::from_utf8_lossy(&buf[..len]);
        let relates = element_text(&body, "MessageID");

        let reply = match classify(&body) {
            Some(WsdAction::Probe) => {
                let Some(source) = self.source_for(remote, ep) else {
                    return Ok(());
                };
                debug!(%remote, "probe");
                self.probe_matches(relates, &self.xaddrs(source, ep.port))
            }
            Some(WsdAction::Resolve) => {
                // Only answer a resolve that names this device.
                if !body.contains(&self.uuid) {
                    return Ok(());
                }
                let Some(source) = self.source_for(remote, ep) else {
                    return Ok(());
                };
                debug!(%remote, "resolve");
                self.resolve_matches(relates, &self.xaddrs(source, ep.port))
            }
            _ => {
                trace!(%remote, bytes = len, "ignored datagram");
                return Ok(());
            }
        };

        sendto(ep.raw_fd(), reply.as_bytes(), &src, MsgFlags::empty()).map_err(errno_io)?;
        Ok(())
    }

    /// Accept one connection. Trouble on the accepted stream is that
    /// client's problem, not the listener's.
    fn recv_stream(&self, ep: &mut Endpoint) -> io::Result<()> {
        let fd = accept4(ep.raw_fd(), SockFlag::SOCK_CLOEXEC).map_err(errno_io)?;
        let stream = unsafe { TcpStream::from_raw_fd(fd) };
        if let Err(err) = self.serve_connection(stream) {
            debug!(%err, "http exchange failed");
        }
        Ok(())
    }

    fn serve_connection(&self, mut stream: TcpStream) -> io::Result<()> {
        stream.set_read_timeout(Some(STREAM_TIMEOUT))?;
        stream.set_write_timeout(Some(STREAM_TIMEOUT))?;

        let peer = stream.peer_addr()?;
        let request = read_http_request(&mut stream)?;
        let body = String::from_utf8_lossy(&request);

        let (status, payload) = if classify(&body) == Some(WsdAction::Get) {
            debug!(%peer, "metadata get");
            let relates = element_text(&body, "MessageID");
            ("200 OK", self.metadata(relates))
        } else {
            ("400 Bad Request", String::new())
        };

        let response = format!(
            "HTTP/1.1 {status}\r\n\
             Content-Type: application/soap+xml\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{payload}",
            payload.len()
        );
        stream.write_all(response.as_bytes())?;
        Ok(())
    }
}

impl ServiceHandler for WsdHandler {
    fn init(&self, ep: &mut Endpoint) -> io::Result<()> {
        // Announce only from the multicast endpoints.
        let (Some(group), Some(source)) = (ep.mcast, ep.ifaddr) else {
            return Ok(());
        };
        let hello = self.hello(&self.xaddrs(source, ep.port));
        let to = SockaddrStorage::from(group);
        sendto(ep.raw_fd(), hello.as_bytes(), &to, MsgFlags::empty()).map_err(errno_io)?;
        debug!(iface = %ep.ifname, "hello sent");
        Ok(())
    }

    fn recv(&self, ep: &mut Endpoint) -> io::Result<()> {
        match ep.service.kind {
            SocketKind::Stream => self.recv_stream(ep),
            _ => self.recv_datagram(ep),
        }
    }

    fn exit(&self, ep: &mut Endpoint) {
        let Some(group) = ep.mcast else {
            return;
        };
        let bye = self.bye();
        let to = SockaddrStorage::from(group);
        if let Err(err) = sendto(ep.raw_fd(), bye.as_bytes(), &to, MsgFlags::empty()) {
            debug!(iface = %ep.ifname, err = %errno_io(err), "bye not sent");
        }
    }
}

/// Read one HTTP request, honoring Content-Length when present. Bounded in
/// both size and time.
fn read_http_request(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(n) => n,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                break
            }
            Err(err) => return Err(err),
        };
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() >= MAX_REQUEST {
            break;
        }
        if let Some(head_end) = find_subslice(&data, b"\r\n\r\n") {
            let body_len = content_length(&data[..head_end]).unwrap_or(0);
            if data.len() >= head_end + 4 + body_len {
                break;
            }
        }
    }
    Ok(data)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn content_length(head: &[u8]) -> Option<usize> {
    let head = String::from_utf8_lossy(head);
    head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}
