//! Site descriptions (`HS_SITE` values).
//!
//! A site is an ordered list of servers that are jointly authoritative for a
//! slice of the handle space. Each handle lives on exactly one server of the
//! site, chosen by hashing the handle under the site's [`HashOption`].

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use hs_core::crypto::{CryptoError, PublicKey};
use hs_core::encoding::{read_byte_array, read_count, write_byte_array};
use hs_core::{DecodeError, Handle, HashOption, WireDecode, WireEncode};
use serde::{Deserialize, Serialize};

/// Current site record format version.
pub const SITE_DATA_FORMAT_VERSION: u16 = 1;

const PRIMARY_MASK: u8 = 0x80;
const MULTI_PRIMARY_MASK: u8 = 0x40;
const ROOT_MASK: u8 = 0x20;

/// Transport protocol of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Protocol {
    /// UDP datagrams, 512 bytes per packet.
    Udp = 0,
    /// TCP stream.
    Tcp = 1,
    /// HTTP POST.
    Http = 2,
    /// HTTP over TLS.
    Https = 3,
}

impl Protocol {
    /// Parses the wire tag.
    pub fn from_u8(tag: u8) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(Self::Udp),
            1 => Ok(Self::Tcp),
            2 => Ok(Self::Http),
            3 => Ok(Self::Https),
            _ => Err(DecodeError::InvalidEnumTag(tag as u32)),
        }
    }

    /// Lower-case name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Self::Udp),
            "tcp" => Ok(Self::Tcp),
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            _ => Err(format!("unknown protocol {s:?}")),
        }
    }
}

/// Which requests an interface accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum InterfaceType {
    /// Accepts nothing.
    OutOfService = 0,
    /// Administrative requests only.
    Admin = 1,
    /// Queries only.
    Query = 2,
    /// Both.
    Both = 3,
}

impl InterfaceType {
    fn from_u8(tag: u8) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(Self::OutOfService),
            1 => Ok(Self::Admin),
            2 => Ok(Self::Query),
            3 => Ok(Self::Both),
            _ => Err(DecodeError::InvalidEnumTag(tag as u32)),
        }
    }
}

/// A protocol endpoint on a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interface {
    /// Accepted request kinds.
    pub kind: InterfaceType,
    /// Transport.
    pub protocol: Protocol,
    /// Port.
    pub port: u32,
}

impl Interface {
    /// Creates an interface.
    pub fn new(kind: InterfaceType, protocol: Protocol, port: u16) -> Self {
        Self {
            kind,
            protocol,
            port: port as u32,
        }
    }

    /// True if the interface accepts admin (`true`) or query (`false`)
    /// requests.
    pub fn can_handle(&self, admin: bool) -> bool {
        match self.kind {
            InterfaceType::OutOfService => false,
            InterfaceType::Admin => admin,
            InterfaceType::Query => !admin,
            InterfaceType::Both => true,
        }
    }
}

/// One server of a site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Server number as assigned by the site.
    pub server_id: u32,
    /// Address; IPv4 is carried mapped into IPv6.
    pub address: IpAddr,
    /// Public key record.
    pub public_key: Bytes,
    /// Endpoints.
    pub interfaces: Vec<Interface>,
}

impl ServerInfo {
    /// First interface speaking `protocol` that accepts the request kind.
    pub fn interface(&self, protocol: Protocol, admin: bool) -> Option<&Interface> {
        self.interfaces
            .iter()
            .find(|i| i.protocol == protocol && i.can_handle(admin))
    }

    /// Socket address of an interface.
    pub fn socket_addr(&self, interface: &Interface) -> SocketAddr {
        SocketAddr::new(self.address, interface.port as u16)
    }

    /// Decodes the server's public key.
    pub fn public_key(&self) -> Result<PublicKey, CryptoError> {
        PublicKey::decode(&self.public_key)
    }

    /// Stable `address:port` identity for caches.
    pub fn key(&self, interface: &Interface) -> String {
        self.socket_addr(interface).to_string()
    }
}

impl WireEncode for ServerInfo {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.server_id);
        put_address(buf, self.address);
        write_byte_array(buf, &self.public_key);
        buf.put_u32(self.interfaces.len() as u32);
        for iface in &self.interfaces {
            buf.put_u8(iface.kind as u8);
            buf.put_u8(iface.protocol as u8);
            buf.put_u32(iface.port);
        }
    }
}

impl WireDecode for ServerInfo {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let server_id = u32::decode(buf)?;
        let address = get_address(buf)?;
        let public_key = read_byte_array(buf)?;
        let count = read_count(buf)?;
        let mut interfaces = Vec::with_capacity(count.min(16));
        for _ in 0..count {
            interfaces.push(Interface {
                kind: InterfaceType::from_u8(u8::decode(buf)?)?,
                protocol: Protocol::from_u8(u8::decode(buf)?)?,
                port: u32::decode(buf)?,
            });
        }
        Ok(Self {
            server_id,
            address,
            public_key,
            interfaces,
        })
    }
}

/// A resolution site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteInfo {
    /// Record format version.
    pub data_version: u16,
    /// Highest protocol major version the site speaks.
    pub major: u8,
    /// Highest protocol minor version the site speaks.
    pub minor: u8,
    /// Serial number, bumped on every change.
    pub serial: u16,
    /// Primary (writable) site.
    pub is_primary: bool,
    /// One of several primaries.
    pub multi_primary: bool,
    /// Root (global) service site.
    pub is_root: bool,
    /// How handles map to servers.
    pub hash_option: HashOption,
    /// Reserved hash filter.
    pub hash_filter: Bytes,
    /// Free-form attributes.
    pub attributes: Vec<(Bytes, Bytes)>,
    /// Servers, ordered by server number.
    pub servers: Vec<ServerInfo>,
}

impl SiteInfo {
    /// Creates a site of the given servers.
    pub fn new(servers: Vec<ServerInfo>) -> Self {
        Self {
            data_version: SITE_DATA_FORMAT_VERSION,
            major: hs_core::MAJOR_VERSION,
            minor: hs_core::MINOR_VERSION,
            serial: 1,
            is_primary: false,
            multi_primary: false,
            is_root: false,
            hash_option: HashOption::ByAll,
            hash_filter: Bytes::new(),
            attributes: Vec::new(),
            servers,
        }
    }

    /// Looks up an attribute.
    pub fn attribute(&self, key: &[u8]) -> Option<&Bytes> {
        self.attributes
            .iter()
            .find(|(k, _)| k.as_ref().eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    /// Description attribute, if present.
    pub fn description(&self) -> Option<String> {
        self.attribute(b"desc")
            .map(|d| String::from_utf8_lossy(d).into_owned())
    }

    /// The server responsible for `handle`.
    pub fn determine_server(&self, handle: &Handle) -> Option<&ServerInfo> {
        if self.servers.is_empty() {
            return None;
        }
        let n = handle.server_number(self.hash_option, self.servers.len());
        self.servers.get(n)
    }

    /// True if any server offers an interface for the protocol and request
    /// kind.
    pub fn has_usable_interface(&self, protocol: Protocol, admin: bool) -> bool {
        self.servers
            .iter()
            .any(|s| s.interface(protocol, admin).is_some())
    }

    /// Decodes a site from `HS_SITE` value data.
    pub fn from_value_data(data: &[u8]) -> Result<Self, DecodeError> {
        Self::from_bytes(data)
    }
}

impl WireEncode for SiteInfo {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.data_version);
        buf.put_u8(self.major);
        buf.put_u8(self.minor);
        buf.put_u16(self.serial);
        let mut mask = 0u8;
        if self.is_primary {
            mask |= PRIMARY_MASK;
        }
        if self.multi_primary {
            mask |= MULTI_PRIMARY_MASK;
        }
        if self.is_root {
            mask |= ROOT_MASK;
        }
        buf.put_u8(mask);
        buf.put_u8(self.hash_option as u8);
        write_byte_array(buf, &self.hash_filter);
        buf.put_u32(self.attributes.len() as u32);
        for (k, v) in &self.attributes {
            write_byte_array(buf, k);
            write_byte_array(buf, v);
        }
        self.servers.encode(buf);
    }
}

impl WireDecode for SiteInfo {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let data_version = u16::decode(buf)?;
        let major = u8::decode(buf)?;
        let minor = u8::decode(buf)?;
        let serial = u16::decode(buf)?;
        let mask = u8::decode(buf)?;
        let hash_option = HashOption::from_u8(u8::decode(buf)?)?;
        let hash_filter = read_byte_array(buf)?;
        let count = read_count(buf)?;
        let mut attributes = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            attributes.push((read_byte_array(buf)?, read_byte_array(buf)?));
        }
        let servers = Vec::<ServerInfo>::decode(buf)?;
        Ok(Self {
            data_version,
            major,
            minor,
            serial,
            is_primary: mask & PRIMARY_MASK != 0,
            multi_primary: mask & MULTI_PRIMARY_MASK != 0,
            is_root: mask & ROOT_MASK != 0,
            hash_option,
            hash_filter,
            attributes,
            servers,
        })
    }
}

/// Translation from advertised server addresses to the addresses usable
/// from inside a local network. Sites behind NAT advertise their public
/// address; peers on the same network connect through this map instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressMap {
    entries: Vec<(IpAddr, IpAddr)>,
}

impl AddressMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `advertised` to `local`, replacing an earlier mapping.
    pub fn insert(&mut self, advertised: IpAddr, local: IpAddr) {
        match self.entries.iter_mut().find(|(from, _)| *from == advertised) {
            Some(entry) => entry.1 = local,
            None => self.entries.push((advertised, local)),
        }
    }

    /// Number of mappings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The address to connect to for `addr`.
    pub fn translate(&self, addr: IpAddr) -> IpAddr {
        self.entries
            .iter()
            .find(|(from, _)| *from == addr)
            .map_or(addr, |(_, to)| *to)
    }

    /// [`translate`](Self::translate) keeping the port.
    pub fn translate_socket(&self, addr: SocketAddr) -> SocketAddr {
        SocketAddr::new(self.translate(addr.ip()), addr.port())
    }
}

fn put_address(buf: &mut BytesMut, addr: IpAddr) {
    let v6 = match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    };
    buf.put_slice(&v6.octets());
}

fn get_address(buf: &mut Bytes) -> Result<IpAddr, DecodeError> {
    let v6 = Ipv6Addr::from(<[u8; 16]>::decode(buf)?);
    Ok(match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    })
}

impl WireEncode for AddressMap {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.entries.len() as u32);
        for (from, to) in &self.entries {
            put_address(buf, *from);
            put_address(buf, *to);
        }
    }
}

impl WireDecode for AddressMap {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let count = read_count(buf)?;
        let mut map = Self::new();
        for _ in 0..count {
            let from = get_address(buf)?;
            let to = get_address(buf)?;
            map.insert(from, to);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn server(id: u32, addr: IpAddr) -> ServerInfo {
        ServerInfo {
            server_id: id,
            address: addr,
            public_key: Bytes::from_static(b"key"),
            interfaces: vec![
                Interface::new(InterfaceType::Both, Protocol::Tcp, 2641),
                Interface::new(InterfaceType::Query, Protocol::Udp, 2641),
                Interface::new(InterfaceType::OutOfService, Protocol::Http, 8000),
            ],
        }
    }

    fn site() -> SiteInfo {
        let mut site = SiteInfo::new(vec![
            server(0, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))),
            server(1, IpAddr::V6(Ipv6Addr::LOCALHOST)),
        ]);
        site.is_primary = true;
        site.hash_option = HashOption::ByPrefix;
        site.attributes
            .push((Bytes::from_static(b"desc"), Bytes::from_static(b"test site")));
        site
    }

    #[test]
    fn test_roundtrip() {
        let s = site();
        let decoded = SiteInfo::from_bytes(&s.to_bytes().to_vec()).unwrap();
        assert_eq!(decoded, s);
        assert_eq!(
            decoded.servers[0].address,
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
        );
    }

    #[test]
    fn test_interface_selection() {
        let s = site();
        let srv = &s.servers[0];
        assert!(srv.interface(Protocol::Tcp, true).is_some());
        assert!(srv.interface(Protocol::Udp, true).is_none());
        assert!(srv.interface(Protocol::Udp, false).is_some());
        assert!(srv.interface(Protocol::Http, false).is_none());
        assert!(!s.has_usable_interface(Protocol::Https, false));
    }

    #[test]
    fn test_determine_server_is_stable() {
        let s = site();
        let h = Handle::from("10.1000/abc");
        let first = s.determine_server(&h).unwrap().server_id;
        for _ in 0..5 {
            assert_eq!(s.determine_server(&h).unwrap().server_id, first);
        }
        // By-prefix: every handle under one prefix lands on one server.
        assert_eq!(
            s.determine_server(&Handle::from("10.1000/zzz")).unwrap().server_id,
            first
        );
        assert!(SiteInfo::new(vec![]).determine_server(&h).is_none());
    }

    #[test]
    fn test_attributes() {
        assert_eq!(site().description().unwrap(), "test site");
        assert!(site().attribute(b"missing").is_none());
    }

    #[test]
    fn test_address_map_translation() {
        let public = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        let inside = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
        let mut map = AddressMap::new();
        map.insert(public, IpAddr::V6(Ipv6Addr::LOCALHOST));
        map.insert(public, inside);
        map.insert(IpAddr::V6(Ipv6Addr::LOCALHOST), public);
        assert_eq!(map.len(), 2);

        assert_eq!(map.translate_socket(SocketAddr::new(public, 2641)), SocketAddr::new(inside, 2641));
        let other = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(map.translate(other), other);

        let decoded = AddressMap::from_bytes(&map.to_bytes().to_vec()).unwrap();
        assert_eq!(decoded, map);
        assert_eq!(map.to_bytes().to_vec().len(), 4 + 2 * 32);
        assert!(AddressMap::from_bytes(&map.to_bytes().to_vec()[..20]).is_err());
    }
}
