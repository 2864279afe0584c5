//! SOCKS5 UDP-Associate support for the obfuscation hop.
//!
//! The client can point its transport at a local SOCKS5 endpoint (typically
//! a Reality-capable relay) instead of sending UDP straight to the server.
//! A TCP control stream negotiates the association and must stay open for
//! as long as datagrams flow; each datagram is then wrapped in the 10-byte
//! UDP-Associate envelope and exchanged with the relay's UDP endpoint.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::wire::SOCKS5_ENVELOPE_SIZE;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const REPLY_SUCCESS: u8 = 0x00;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Dial timeout for the relay control connection.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// An established UDP association with a SOCKS5 relay.
pub struct SocksAssociation {
    /// Control stream; the relay invalidates the association when it closes.
    control: Mutex<Option<TcpStream>>,
    relay: SocketAddr,
    target_ip: Ipv4Addr,
    target_port: u16,
}

impl SocksAssociation {
    /// Negotiate a UDP association with the relay at `proxy`.
    ///
    /// Performs the no-auth greeting, issues UDP ASSOCIATE with the IPv4
    /// null address, and resolves the relay's UDP endpoint from the bind
    /// reply. A `0.0.0.0` bound address is substituted with the proxy host.
    pub async fn establish(proxy: SocketAddr, target: SocketAddr) -> Result<Self> {
        let (target_ip, target_port) = match target {
            SocketAddr::V4(v4) => (*v4.ip(), v4.port()),
            SocketAddr::V6(_) => {
                return Err(Error::transport_init(
                    "SOCKS5 envelope requires an IPv4 server endpoint",
                ))
            }
        };

        let mut control = timeout(DIAL_TIMEOUT, TcpStream::connect(proxy))
            .await
            .map_err(|_| Error::transport_init(format!("SOCKS5 dial to {proxy} timed out")))?
            .map_err(|e| Error::transport_init(format!("SOCKS5 dial to {proxy} failed: {e}")))?;

        // Greeting: one offered method, no authentication.
        control
            .write_all(&[SOCKS_VERSION, 0x01, METHOD_NO_AUTH])
            .await?;
        let mut chosen = [0u8; 2];
        control.read_exact(&mut chosen).await?;
        if chosen != [SOCKS_VERSION, METHOD_NO_AUTH] {
            return Err(Error::transport_init(format!(
                "SOCKS5 greeting rejected: {chosen:02x?}"
            )));
        }

        // UDP ASSOCIATE with the IPv4 null address: we do not know our
        // source port ahead of time and the relay must accept any.
        control
            .write_all(&[
                SOCKS_VERSION,
                CMD_UDP_ASSOCIATE,
                0x00,
                ATYP_IPV4,
                0, 0, 0, 0,
                0, 0,
            ])
            .await?;

        let mut head = [0u8; 4];
        control.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION || head[1] != REPLY_SUCCESS {
            return Err(Error::transport_init(format!(
                "UDP associate refused: reply code {:#04x}",
                head[1]
            )));
        }

        let bound = read_bound_address(&mut control, head[3]).await?;
        let relay = if bound.ip().is_unspecified() {
            SocketAddr::new(proxy.ip(), bound.port())
        } else {
            bound
        };

        info!(%relay, %target, "SOCKS5 UDP association established");

        Ok(Self {
            control: Mutex::new(Some(control)),
            relay,
            target_ip,
            target_port,
        })
    }

    /// The relay's UDP endpoint all wrapped datagrams are sent to.
    pub fn relay(&self) -> SocketAddr {
        self.relay
    }

    /// The final VPN server endpoint the envelope addresses.
    pub fn target(&self) -> SocketAddr {
        SocketAddr::from((self.target_ip, self.target_port))
    }

    /// Prefix a datagram with the request envelope addressed to the server.
    pub fn wrap(&self, datagram: &[u8]) -> BytesMut {
        let mut out = BytesMut::with_capacity(SOCKS5_ENVELOPE_SIZE + datagram.len());
        out.put_slice(&[0x00, 0x00, 0x00, ATYP_IPV4]);
        out.put_slice(&self.target_ip.octets());
        out.put_u16(self.target_port);
        out.put_slice(datagram);
        out
    }

    /// Validate an incoming envelope and return the payload offset.
    ///
    /// Accepts IPv4, domain, and IPv6 address forms; fragmented relaying
    /// is not supported.
    pub fn strip(buf: &[u8]) -> Result<usize> {
        if buf.len() < 5 {
            return Err(Error::packet("SOCKS5 envelope truncated"));
        }
        if buf[0] != 0x00 || buf[1] != 0x00 {
            return Err(Error::packet("SOCKS5 envelope: nonzero reserved bytes"));
        }
        if buf[2] != 0x00 {
            return Err(Error::packet("SOCKS5 envelope: fragmentation not supported"));
        }

        let offset = match buf[3] {
            ATYP_IPV4 => 4 + 4 + 2,
            ATYP_DOMAIN => 4 + 1 + buf[4] as usize + 2,
            ATYP_IPV6 => 4 + 16 + 2,
            other => {
                return Err(Error::packet(format!(
                    "SOCKS5 envelope: unknown address type {other:#04x}"
                )))
            }
        };

        if buf.len() <= offset {
            return Err(Error::packet("SOCKS5 envelope: no payload"));
        }
        Ok(offset)
    }

    /// Drop the control stream, ending the association on the relay.
    pub fn close(&self) {
        if self.control.lock().take().is_some() {
            debug!("SOCKS5 control stream closed");
        }
    }
}

/// Read the bound address of a reply, in whichever form the relay chose.
async fn read_bound_address(control: &mut TcpStream, atyp: u8) -> Result<SocketAddr> {
    match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            control.read_exact(&mut buf).await?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Ok(SocketAddr::from((ip, port)))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            control.read_exact(&mut buf).await?;
            let ip: [u8; 16] = buf[..16].try_into().unwrap();
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Ok(SocketAddr::from((ip, port)))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            control.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize + 2];
            control.read_exact(&mut name).await?;
            let port = u16::from_be_bytes([name[len[0] as usize], name[len[0] as usize + 1]]);
            let host = String::from_utf8_lossy(&name[..len[0] as usize]).into_owned();
            let resolved = tokio::net::lookup_host((host.as_str(), port))
                .await
                .map_err(|e| Error::transport_init(format!("cannot resolve relay host {host}: {e}")))?
                .next()
                .ok_or_else(|| {
                    Error::transport_init(format!("relay host {host} resolved to nothing"))
                });
            resolved
        }
        other => Err(Error::transport_init(format!(
            "UDP associate reply has unknown address type {other:#04x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn association() -> SocksAssociation {
        SocksAssociation {
            control: Mutex::new(None),
            relay: "127.0.0.1:1080".parse().unwrap(),
            target_ip: Ipv4Addr::new(203, 0, 113, 9),
            target_port: 8080,
        }
    }

    #[test]
    fn test_wrap_layout() {
        let assoc = association();
        let wrapped = assoc.wrap(b"payload");
        assert_eq!(
            &wrapped[..SOCKS5_ENVELOPE_SIZE],
            &[0, 0, 0, ATYP_IPV4, 203, 0, 113, 9, 0x1F, 0x90]
        );
        assert_eq!(&wrapped[SOCKS5_ENVELOPE_SIZE..], b"payload");
    }

    #[test]
    fn test_strip_ipv4() {
        let assoc = association();
        let wrapped = assoc.wrap(b"payload");
        let offset = SocksAssociation::strip(&wrapped).unwrap();
        assert_eq!(offset, SOCKS5_ENVELOPE_SIZE);
        assert_eq!(&wrapped[offset..], b"payload");
    }

    #[test]
    fn test_strip_domain() {
        let mut buf = vec![0, 0, 0, ATYP_DOMAIN, 7];
        buf.extend_from_slice(b"example");
        buf.extend_from_slice(&[0x00, 0x50]);
        buf.extend_from_slice(b"inner");
        let offset = SocksAssociation::strip(&buf).unwrap();
        assert_eq!(&buf[offset..], b"inner");
    }

    #[test]
    fn test_strip_ipv6() {
        let mut buf = vec![0, 0, 0, ATYP_IPV6];
        buf.extend_from_slice(&[0u8; 16]);
        buf.extend_from_slice(&[0x1F, 0x90]);
        buf.extend_from_slice(b"inner");
        let offset = SocksAssociation::strip(&buf).unwrap();
        assert_eq!(&buf[offset..], b"inner");
    }

    #[test]
    fn test_strip_rejects_fragments() {
        let mut buf = vec![0, 0, 1, ATYP_IPV4];
        buf.extend_from_slice(&[127, 0, 0, 1, 0, 80]);
        buf.extend_from_slice(b"inner");
        assert!(SocksAssociation::strip(&buf).is_err());
    }

    #[test]
    fn test_strip_rejects_bad_reserved() {
        let buf = [1, 0, 0, ATYP_IPV4, 127, 0, 0, 1, 0, 80, 0xAA];
        assert!(SocksAssociation::strip(&buf).is_err());
    }

    #[test]
    fn test_strip_rejects_unknown_atyp() {
        let buf = [0, 0, 0, 0x05, 127, 0, 0, 1, 0, 80, 0xAA];
        assert!(SocksAssociation::strip(&buf).is_err());
    }

    #[test]
    fn test_strip_rejects_empty_payload() {
        let buf = [0, 0, 0, ATYP_IPV4, 127, 0, 0, 1, 0, 80];
        assert!(SocksAssociation::strip(&buf).is_err());
    }
}
