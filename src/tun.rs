//! TUN device adapter.
//!
//! Wraps the kernel's layer-3 virtual interface as a pair of async halves:
//! reads surface complete inbound IP packets, writes inject outbound ones.
//! Each pump direction owns its half exclusively, so the two never contend.

use std::net::Ipv4Addr;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, info};
use tun::AsyncDevice;

use crate::error::{Error, Result};
use crate::{TUN_MTU, VPN_NETMASK};

/// A created-and-up TUN interface.
pub struct TunInterface {
    name: String,
    device: AsyncDevice,
}

impl TunInterface {
    /// Create (or attach to) the interface, assign `address/24`, set the
    /// MTU, and bring the link up.
    pub fn create(name: &str, address: Ipv4Addr) -> Result<Self> {
        let mut config = tun::Configuration::default();
        config
            .name(name)
            .address(address)
            .netmask(VPN_NETMASK)
            .mtu(TUN_MTU as i32)
            .up();

        // Plain IP packets, no packet-information prefix.
        #[cfg(target_os = "linux")]
        config.platform(|platform| {
            platform.packet_information(false);
        });

        let device = tun::create_as_async(&config)
            .map_err(|e| Error::platform(format!("failed to create TUN device {name}: {e}")))?;

        info!(device = name, %address, mtu = TUN_MTU, "TUN interface up");

        Ok(Self {
            name: name.to_string(),
            device,
        })
    }

    /// Interface name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Split into independent read and write halves.
    pub fn into_split(self) -> (TunReader, TunWriter) {
        let (reader, writer) = tokio::io::split(self.device);
        debug!(device = %self.name, "TUN interface split for pumping");
        (TunReader { inner: reader }, TunWriter { inner: writer })
    }
}

/// Read half of a TUN interface.
pub struct TunReader {
    inner: ReadHalf<AsyncDevice>,
}

impl TunReader {
    /// Read one complete IP packet into `buf`. Returns 0 at device EOF.
    pub async fn read_packet(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.inner.read(buf).await?)
    }
}

/// Write half of a TUN interface.
pub struct TunWriter {
    inner: WriteHalf<AsyncDevice>,
}

impl TunWriter {
    /// Inject one IP packet into the interface.
    pub async fn write_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.inner.write_all(packet).await?;
        Ok(())
    }
}
