use std::net::Ipv4Addr;
use std::process::Command;

/// Adds a host route for the /24 containing the TUN address, pointed
/// back at that address. macOS does not install one when the interface
/// comes up, so without it overlay traffic never reaches the device.
pub fn add_overlay_route(addr: &Ipv4Addr) -> crate::Result<()> {
    let octets = addr.octets();
    let subnet = format!("{}.{}.{}.0/24", octets[0], octets[1], octets[2]);
    let gateway = addr.to_string();

    let output = Command::new("route")
        .args(["-n", "add", "-net", &subnet, &gateway])
        .output()
        .map_err(|e| format!("failed to execute route command: {}", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("failed to add route {}: {}", subnet, stderr).into());
    }

    tracing::debug!("added overlay route {} via {}", subnet, gateway);
    Ok(())
}
