//! UDP-based device discovery.
//! Listens passively for presence broadcasts on the device broadcast ports
//! and decodes them into device records.

use crate::cipher::Cipher;
use crate::error::{Error, Result};
use crate::protocol::{self, Version};
use log::{debug, info, warn};
use serde_json::Value;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::net::UdpSocket;
use tokio::time::{Duration, Instant, sleep_until};

/// Plaintext broadcast port.
pub const BROADCAST_PORT: u16 = 6666;
/// Encrypted broadcast port.
pub const BROADCAST_PORT_ENCRYPTED: u16 = 6667;

/// Well-known broadcast key, provisioned on every firmware: the MD5
/// digest of `"yGAdlopoPVldABfn"`, hard-coded so discovery needs no
/// hashing at startup.
pub const UDP_KEY: [u8; 16] = [
    0x6c, 0x1e, 0xc8, 0xe2, 0xbb, 0x9b, 0xb5, 0x9a, 0xb5, 0x0b, 0x0d, 0xaf, 0x64, 0x9b, 0x41, 0x0a,
];

/// A device record harvested from a presence broadcast.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub id: String,
    pub ip: String,
    pub version: Option<Version>,
    pub product_key: Option<String>,
    /// DP map some firmwares include in their broadcast; drives the
    /// refresh-index auto-tuning.
    pub dps: Option<Value>,
}

/// What a [`Discovery::find`] call is matching on.
#[derive(Debug, Clone, Copy)]
pub enum FindQuery<'a> {
    Id(&'a str),
    Ip(&'a str),
}

/// Passive discovery listener for the device broadcast ports.
pub struct Discovery {
    /// How long to wait for a matching broadcast.
    pub timeout: Duration,
    /// Local address to bind to.
    pub bind_addr: String,
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new()
    }
}

impl Discovery {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            bind_addr: "0.0.0.0".to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Wait for a broadcast matching `query`.
    ///
    /// `local_key` enables the second decryption attempt for firmwares
    /// that broadcast under the device key instead of the well-known one.
    /// Fails with [`Error::FindTimeout`] when nothing matches in time;
    /// both listener sockets are released on every exit path.
    pub async fn find(
        &self,
        query: FindQuery<'_>,
        local_key: Option<&[u8]>,
    ) -> Result<DiscoveredDevice> {
        let plain = self.bind_socket(BROADCAST_PORT)?;
        let encrypted = self.bind_socket(BROADCAST_PORT_ENCRYPTED)?;
        let deadline = Instant::now() + self.timeout;

        let mut buf_a = vec![0u8; 4096];
        let mut buf_b = vec![0u8; 4096];
        loop {
            let datagram = tokio::select! {
                _ = sleep_until(deadline) => return Err(Error::FindTimeout),
                res = plain.recv_from(&mut buf_a) => res.map(|(n, addr)| (buf_a[..n].to_vec(), addr)),
                res = encrypted.recv_from(&mut buf_b) => res.map(|(n, addr)| (buf_b[..n].to_vec(), addr)),
            };
            let (data, addr) = datagram?;
            debug!("broadcast from {}: {} bytes", addr, data.len());

            if let Some(device) = parse_broadcast(&data, local_key) {
                let matched = match query {
                    FindQuery::Id(id) => device.id == id,
                    FindQuery::Ip(ip) => device.ip == ip,
                };
                if matched {
                    info!("found device {} at {}", device.id, device.ip);
                    return Ok(device);
                }
            }
        }
    }

    /// Accumulate every `(id, ip)` pair seen until the timeout expires.
    pub async fn find_all(&self) -> Result<Vec<DiscoveredDevice>> {
        let plain = self.bind_socket(BROADCAST_PORT)?;
        let encrypted = self.bind_socket(BROADCAST_PORT_ENCRYPTED)?;
        let deadline = Instant::now() + self.timeout;

        let mut seen = HashSet::new();
        let mut devices = Vec::new();
        let mut buf_a = vec![0u8; 4096];
        let mut buf_b = vec![0u8; 4096];
        loop {
            let datagram = tokio::select! {
                _ = sleep_until(deadline) => break,
                res = plain.recv_from(&mut buf_a) => res.map(|(n, _)| buf_a[..n].to_vec()),
                res = encrypted.recv_from(&mut buf_b) => res.map(|(n, _)| buf_b[..n].to_vec()),
            };
            if let Some(device) = parse_broadcast(&datagram?, None)
                && seen.insert((device.id.clone(), device.ip.clone()))
            {
                devices.push(device);
            }
        }
        info!("discovery sweep finished, {} devices", devices.len());
        Ok(devices)
    }

    /// Bind a reusable, broadcast-enabled UDP socket and hand it to tokio.
    fn bind_socket(&self, port: u16) -> Result<UdpSocket> {
        let addr: SocketAddr = format!("{}:{}", self.bind_addr, port)
            .parse()
            .map_err(|e| Error::Config(format!("bad bind address: {e}")))?;

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if let Err(e) = socket.set_reuse_address(true) {
            warn!("failed to set reuse_address on port {}: {}", port, e);
        }
        if let Err(e) = socket.set_broadcast(true) {
            warn!("failed to set broadcast on port {}: {}", port, e);
        }
        socket.bind(&SockAddr::from(addr))?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }
}

/// Decode one broadcast datagram into a device record.
///
/// Plaintext JSON first (port 6666), then a framed packet under the
/// well-known key, then under the caller's local key — some firmwares
/// broadcast encrypted with the device key.
fn parse_broadcast(data: &[u8], local_key: Option<&[u8]>) -> Option<DiscoveredDevice> {
    if let Ok(value) = serde_json::from_slice::<Value>(data) {
        return device_from_json(&value);
    }

    let udp_cipher = Cipher::new(&UDP_KEY, Version::V3_3).ok()?;
    if let Some(device) = decode_framed(&udp_cipher, data) {
        return Some(device);
    }

    if let Some(key) = local_key
        && let Ok(cipher) = Cipher::new(key, Version::V3_3)
        && let Some(device) = decode_framed(&cipher, data)
    {
        return Some(device);
    }

    debug!("unparseable broadcast of {} bytes", data.len());
    None
}

fn decode_framed(cipher: &Cipher, data: &[u8]) -> Option<DiscoveredDevice> {
    let frames = protocol::decode(cipher, data).ok()?;
    frames
        .iter()
        .find_map(|frame| frame.payload.as_json().and_then(device_from_json))
}

fn device_from_json(value: &Value) -> Option<DiscoveredDevice> {
    let id = value
        .get("gwId")
        .or_else(|| value.get("devId"))
        .or_else(|| value.get("id"))
        .and_then(Value::as_str)?;
    let ip = value.get("ip").and_then(Value::as_str)?;

    Some(DiscoveredDevice {
        id: id.to_string(),
        ip: ip.to_string(),
        version: value
            .get("version")
            .and_then(Value::as_str)
            .and_then(|s| Version::from_str(s).ok()),
        product_key: value
            .get("productKey")
            .and_then(Value::as_str)
            .map(str::to_string),
        dps: value.get("dps").cloned(),
    })
}

/// DP indices a refresh should poke, tuned from a broadcast's `dps` map:
/// firmwares without DP 19 want the legacy `{4, 5, 6}` set.
pub fn refresh_indices(dps: &Value) -> Vec<u32> {
    let has_19 = dps.as_object().is_some_and(|m| m.contains_key("19"));
    if has_19 { vec![18, 19, 20] } else { vec![4, 5, 6] }
}
