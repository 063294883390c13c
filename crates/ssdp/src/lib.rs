// SSDP discovery: send an M-SEARCH on every network interface and collect
// the unique replies.
//
// The whole operation is intentionally lossy: interfaces that cannot be
// configured, sockets that time out and replies that do not parse all
// contribute zero records instead of errors.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use anyhow::Context;
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};

pub const SSDP_MULTICAST_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 1900));
pub const SONY_SERVICE_TYPE: &str = "urn:schemas-sony-com:service:ScalarWebAPI:1";
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(2);

const SSDP_RECV_BUF_LEN: usize = 1024;

/// SSDP reply headers, lower-cased name to value. Two records with the same
/// sorted (name, value) pairs describe the same device, which is exactly how
/// `BTreeMap` equality behaves.
pub type DiscoveryRecord = BTreeMap<String, String>;

pub fn make_msearch_request(st: &str) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: 239.255.255.250:1900\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 1\r\n\
         ST: {st}\r\n\
         \r\n"
    )
}

/// Parse the header section of an SSDP reply. The status line is ignored,
/// header names are lower-cased and values keep everything after the first
/// colon (sans leading whitespace).
pub fn parse_ssdp_response(data: &[u8]) -> anyhow::Result<DiscoveryRecord> {
    let text = std::str::from_utf8(data).context("SSDP reply is not valid utf-8")?;
    let mut lines = text.split("\r\n");
    let _status_line = lines.next();
    let mut headers = DiscoveryRecord::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .with_context(|| format!("header line without a colon: {line:?}"))?;
        headers.insert(name.to_ascii_lowercase(), value.trim_start().to_string());
    }
    Ok(headers)
}

pub struct SsdpDiscoverer {
    service_type: String,
    sockets: Vec<UdpSocket>,
}

impl SsdpDiscoverer {
    pub fn new(service_type: &str) -> Self {
        Self::with_timeout(service_type, DEFAULT_RECV_TIMEOUT)
    }

    /// One UDP socket per usable network interface. Interfaces that cannot
    /// be set up are skipped.
    pub fn with_timeout(service_type: &str, timeout: Duration) -> Self {
        let interfaces = match NetworkInterface::show() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                warn!("failed to enumerate network interfaces: {e}");
                Vec::new()
            }
        };
        let mut seen_names = HashSet::new();
        let mut sockets = Vec::new();
        for iface in interfaces {
            if !seen_names.insert(iface.name.clone()) {
                continue;
            }
            match socket_for_interface(&iface, timeout) {
                Ok(socket) => sockets.push(socket),
                Err(e) => debug!(iface = iface.name.as_str(), "skipping interface: {e:#}"),
            }
        }
        Self {
            service_type: service_type.to_string(),
            sockets,
        }
    }

    /// Send one M-SEARCH per socket and read at most one reply from each.
    /// Returns the deduplicated set of discovery records.
    pub fn query(&self) -> Vec<DiscoveryRecord> {
        let msg = make_msearch_request(&self.service_type);
        let mut unique: BTreeSet<DiscoveryRecord> = BTreeSet::new();
        let mut buf = [0u8; SSDP_RECV_BUF_LEN];
        for socket in &self.sockets {
            if let Err(e) = socket.send_to(msg.as_bytes(), SSDP_MULTICAST_ADDR) {
                trace!("M-SEARCH send failed: {e}");
                continue;
            }
            let len = match socket.recv(&mut buf) {
                Ok(len) => len,
                Err(e) => {
                    trace!("no SSDP reply: {e}");
                    continue;
                }
            };
            match parse_ssdp_response(&buf[..len]) {
                Ok(record) => {
                    unique.insert(record);
                }
                Err(e) => trace!("ignoring malformed SSDP reply: {e:#}"),
            }
        }
        debug!(records = unique.len(), "SSDP query finished");
        unique.into_iter().collect()
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }
}

fn socket_for_interface(
    iface: &NetworkInterface,
    timeout: Duration,
) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("failed to create UDP socket")?;
    socket.set_reuse_address(true)?;
    socket.set_multicast_ttl_v4(2)?;
    socket.set_read_timeout(Some(timeout))?;
    // Scope the M-SEARCH to this interface where the platform supports it,
    // otherwise send unbound.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    socket
        .bind_device(Some(iface.name.as_bytes()))
        .with_context(|| format!("SO_BINDTODEVICE({})", iface.name))?;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    socket
        .bind_device_by_index_v4(std::num::NonZeroU32::new(iface.index))
        .with_context(|| format!("IP_BOUND_IF({})", iface.index))?;
    trace!(iface = iface.name.as_str(), "SSDP socket configured");
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msearch_request_format() {
        let msg = make_msearch_request(SONY_SERVICE_TYPE);
        assert_eq!(
            msg,
            "M-SEARCH * HTTP/1.1\r\n\
             HOST: 239.255.255.250:1900\r\n\
             MAN: \"ssdp:discover\"\r\n\
             MX: 1\r\n\
             ST: urn:schemas-sony-com:service:ScalarWebAPI:1\r\n\
             \r\n"
        );
    }

    #[test]
    fn test_parse_response_lowercases_names() {
        let reply = b"HTTP/1.1 200 OK\r\nK1: V1\r\nK2: V2\r\n\r\n";
        let record = parse_ssdp_response(reply).unwrap();
        assert_eq!(record.get("k1").unwrap(), "V1");
        assert_eq!(record.get("k2").unwrap(), "V2");
        assert_eq!(record.len(), 2);
    }

    #[test]
    fn test_parse_response_keeps_inner_colons() {
        let reply =
            b"HTTP/1.1 200 OK\r\nLOCATION: http://10.0.0.2:64321/dd.xml\r\nSERVER: SonyImagingDevice\r\n\r\n";
        let record = parse_ssdp_response(reply).unwrap();
        assert_eq!(
            record.get("location").unwrap(),
            "http://10.0.0.2:64321/dd.xml"
        );
        assert_eq!(record.get("server").unwrap(), "SonyImagingDevice");
    }

    #[test]
    fn test_parse_response_rejects_lines_without_colon() {
        let reply = b"HTTP/1.1 200 OK\r\ngarbage line\r\n\r\n";
        assert!(parse_ssdp_response(reply).is_err());
    }

    #[test]
    fn test_parse_response_rejects_invalid_utf8() {
        assert!(parse_ssdp_response(b"HTTP/1.1 200 OK\r\n\xff\xfe\r\n").is_err());
    }

    #[test]
    fn test_identical_replies_deduplicate() {
        // Two NICs hearing the same camera must yield a single record.
        let reply =
            b"HTTP/1.1 200 OK\r\nServer: SonyImagingDevice\r\nLocation: http://10.0.0.2/dd.xml\r\n\r\n";
        let mut unique: BTreeSet<DiscoveryRecord> = BTreeSet::new();
        unique.insert(parse_ssdp_response(reply).unwrap());
        unique.insert(parse_ssdp_response(reply).unwrap());
        assert_eq!(unique.len(), 1);
        let record = unique.into_iter().next().unwrap();
        assert_eq!(record.get("server").unwrap(), "SonyImagingDevice");
        assert_eq!(record.get("location").unwrap(), "http://10.0.0.2/dd.xml");
    }
}
