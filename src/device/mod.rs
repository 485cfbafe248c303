pub mod packet;
#[cfg(target_os = "macos")]
mod sys_route;

use crate::config::Config;
use async_trait::async_trait;
use tun::AbstractDevice;

/// Byte-oriented handle to a Layer-3 packet device.
///
/// Reads yield complete IP packets and writes inject them. The trait is
/// the seam between the overlay core and the host: production uses the
/// kernel TUN driver, tests substitute channel-backed fakes. `recv` and
/// `send` take `&self` so the pump's workers can share one handle.
#[async_trait]
pub trait PacketIo: Send + Sync {
    async fn recv(&self, buf: &mut [u8]) -> crate::Result<usize>;
    async fn send(&self, buf: &[u8]) -> crate::Result<usize>;
    fn name(&self) -> &str;
}

/// The kernel TUN interface, configured and brought up at creation.
pub struct TunDevice {
    dev: tun::AsyncDevice,
    name: String,
}

impl TunDevice {
    /// Creates the TUN device with the configured address, netmask and
    /// MTU, and installs the macOS host route for the overlay subnet.
    pub fn open(config: &Config) -> crate::Result<Self> {
        let subnet = config.subnet()?;

        let mut tun_config = tun::Configuration::default();
        tun_config
            .address(subnet.addr().to_string())
            .netmask(subnet.netmask().to_string())
            .mtu(config.mtu)
            .up();

        #[cfg(target_os = "linux")]
        tun_config.platform_config(|config| {
            config.ensure_root_privileges(true);
        });

        let dev = tun::create_as_async(&tun_config)?;
        let name = dev.tun_name()?;
        tracing::info!("tun interface {} up with {} mtu {}", name, config.ip, config.mtu);

        #[cfg(target_os = "macos")]
        sys_route::add_overlay_route(&subnet.addr())?;

        Ok(Self { dev, name })
    }
}

#[async_trait]
impl PacketIo for TunDevice {
    async fn recv(&self, buf: &mut [u8]) -> crate::Result<usize> {
        Ok(self.dev.recv(buf).await?)
    }

    async fn send(&self, buf: &[u8]) -> crate::Result<usize> {
        Ok(self.dev.send(buf).await?)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
