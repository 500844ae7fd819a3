//! Fabric Addressing
//!
//! Address blobs are opaque outside the provider that produced them: the
//! conduit manager publishes them, the rendezvous service stores them, and
//! the owning provider's address table decodes them again. Each supported
//! format is one variant of [`AddressFormat`] with exactly one encode and
//! one decode implementation, and its own rendezvous key so consumers
//! always resolve with the key matching the format they expect.

use std::fmt;
use std::net::SocketAddrV4;

use serde::{Deserialize, Serialize};

use super::FabricError;

/// Closed set of address formats supported by the shipped providers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFormat {
    /// IPv4 socket address: 4 address bytes followed by a big-endian port.
    Inet4,
    /// In-process loopback endpoint number: one big-endian `u64`.
    Local,
}

impl AddressFormat {
    /// Rendezvous key under which addresses of this format are published
    /// and resolved.
    #[must_use]
    pub fn rendezvous_key(self) -> &'static str {
        match self {
            Self::Inet4 => "addr-inet4",
            Self::Local => "addr-local",
        }
    }
}

impl fmt::Display for AddressFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rendezvous_key())
    }
}

/// Opaque fabric address blob plus its length.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RawAddress(Vec<u8>);

impl RawAddress {
    /// Wrap raw address bytes.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The address bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length of the blob in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the blob is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for RawAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawAddress({})", hex::encode(&self.0))
    }
}

/// Compact address handle returned by an address table insert, valid only
/// within the conduit whose table produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FabricAddr(pub u64);

/// Encode an IPv4 socket address ([`AddressFormat::Inet4`]).
#[must_use]
pub fn encode_inet4(addr: SocketAddrV4) -> RawAddress {
    let mut bytes = Vec::with_capacity(6);
    bytes.extend_from_slice(&addr.ip().octets());
    bytes.extend_from_slice(&addr.port().to_be_bytes());
    RawAddress(bytes)
}

/// Decode an IPv4 socket address ([`AddressFormat::Inet4`]).
///
/// # Errors
///
/// Returns [`FabricError::InvalidAddress`] if the blob is not 6 bytes.
pub fn decode_inet4(raw: &RawAddress) -> Result<SocketAddrV4, FabricError> {
    let bytes = raw.as_bytes();
    if bytes.len() != 6 {
        return Err(FabricError::InvalidAddress("inet4 blob must be 6 bytes"));
    }
    let ip = std::net::Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);
    Ok(SocketAddrV4::new(ip, port))
}

/// Encode a loopback endpoint number ([`AddressFormat::Local`]).
#[must_use]
pub fn encode_local(endpoint: u64) -> RawAddress {
    RawAddress(endpoint.to_be_bytes().to_vec())
}

/// Decode a loopback endpoint number ([`AddressFormat::Local`]).
///
/// # Errors
///
/// Returns [`FabricError::InvalidAddress`] if the blob is not 8 bytes.
pub fn decode_local(raw: &RawAddress) -> Result<u64, FabricError> {
    let bytes: [u8; 8] = raw
        .as_bytes()
        .try_into()
        .map_err(|_| FabricError::InvalidAddress("local blob must be 8 bytes"))?;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inet4_roundtrip() {
        let addr: SocketAddrV4 = "127.0.0.1:9001".parse().unwrap();
        let raw = encode_inet4(addr);
        assert_eq!(raw.len(), 6);
        assert_eq!(decode_inet4(&raw).unwrap(), addr);
    }

    #[test]
    fn test_local_roundtrip() {
        let raw = encode_local(0xDEAD_BEEF);
        assert_eq!(raw.len(), 8);
        assert_eq!(decode_local(&raw).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert!(decode_inet4(&RawAddress::new(vec![1, 2, 3])).is_err());
        assert!(decode_local(&RawAddress::new(vec![1, 2, 3])).is_err());
    }

    #[test]
    fn test_rendezvous_keys_are_distinct() {
        assert_ne!(
            AddressFormat::Inet4.rendezvous_key(),
            AddressFormat::Local.rendezvous_key()
        );
    }

    #[test]
    fn test_raw_address_debug_is_hex() {
        let raw = RawAddress::new(vec![0xAB, 0xCD]);
        assert_eq!(format!("{raw:?}"), "RawAddress(abcd)");
    }
}
