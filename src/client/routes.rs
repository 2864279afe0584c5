//! Client routing: redirect the default route through the tunnel.
//!
//! Before the default route moves onto the TUN device, an explicit host
//! route to the VPN server via the pre-existing gateway is installed, so
//! the tunnel's own datagrams never try to ride the tunnel. Every change is
//! recorded and undone in LIFO order on restore.

use std::net::IpAddr;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Records and reverses the client's route changes.
pub struct RouteManager {
    tun_interface: String,
    server_ip: IpAddr,
    old_gateway: Option<String>,
    old_interface: Option<String>,
    routes_added: Vec<Vec<String>>,
}

impl RouteManager {
    /// Create a manager for the given TUN interface and server address.
    pub fn new(tun_interface: &str, server_ip: IpAddr) -> Self {
        Self {
            tun_interface: tun_interface.to_string(),
            server_ip,
            old_gateway: None,
            old_interface: None,
            routes_added: Vec::new(),
        }
    }

    /// Capture the current default route, pin the server behind it, and
    /// point the default route at the TUN device.
    pub async fn setup(&mut self) -> Result<()> {
        let (gateway, device) = current_default_route().await?;
        debug!(gateway, device, "captured default route");
        self.old_gateway = Some(gateway.clone());
        self.old_interface = Some(device.clone());

        let server_route = vec![
            self.server_ip.to_string(),
            "via".to_string(),
            gateway,
            "dev".to_string(),
            device,
        ];
        add_route(&server_route).await?;
        self.routes_added.push(server_route);

        if let Err(err) = delete_route(&["default".to_string()]).await {
            debug!(error = %err, "old default route not deleted");
        }

        let default_route = vec![
            "default".to_string(),
            "dev".to_string(),
            self.tun_interface.clone(),
        ];
        add_route(&default_route).await?;
        self.routes_added.push(default_route);

        info!(device = %self.tun_interface, "default route redirected through the tunnel");
        Ok(())
    }

    /// Undo every added route in LIFO order and reinstall the previous
    /// default. Best-effort: failures are logged, never propagated.
    pub async fn restore(&mut self) {
        while let Some(route) = self.routes_added.pop() {
            if let Err(err) = delete_route(&route).await {
                warn!(route = route.join(" "), error = %err, "failed to delete route");
            }
        }

        if let Some(device) = self.old_interface.take() {
            let mut route = vec!["default".to_string()];
            if let Some(gateway) = self.old_gateway.take() {
                route.push("via".to_string());
                route.push(gateway);
            }
            route.push("dev".to_string());
            route.push(device);

            match add_route(&route).await {
                Ok(()) => info!("previous default route restored"),
                Err(err) => warn!(error = %err, "failed to restore previous default route"),
            }
        }
    }
}

/// Run `ip route add`, tolerating routes that already exist.
async fn add_route(route: &[String]) -> Result<()> {
    let output = Command::new("ip")
        .args(["route", "add"])
        .args(route)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.contains("File exists") {
            return Err(Error::platform(format!(
                "ip route add {} failed: {}",
                route.join(" "),
                stderr.trim()
            )));
        }
    }
    Ok(())
}

/// Run `ip route del`.
async fn delete_route(route: &[String]) -> Result<()> {
    let output = Command::new("ip")
        .args(["route", "del"])
        .args(route)
        .output()
        .await?;

    if !output.status.success() {
        return Err(Error::platform(format!(
            "ip route del {} failed: {}",
            route.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Recover `(gateway, device)` from `ip route show default`.
async fn current_default_route() -> Result<(String, String)> {
    let output = Command::new("ip")
        .args(["route", "show", "default"])
        .output()
        .await?;

    if !output.status.success() {
        return Err(Error::platform("ip route show default failed"));
    }

    parse_default_route(&String::from_utf8_lossy(&output.stdout))
}

fn parse_default_route(text: &str) -> Result<(String, String)> {
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| Error::platform("no default route found"))?;

    let fields: Vec<&str> = line.split_whitespace().collect();
    let mut gateway = None;
    let mut device = None;
    for pair in fields.windows(2) {
        match pair[0] {
            "via" => gateway = Some(pair[1].to_string()),
            "dev" => device = Some(pair[1].to_string()),
            _ => {}
        }
    }

    match (gateway, device) {
        (Some(gateway), Some(device)) => Ok((gateway, device)),
        _ => Err(Error::platform(format!(
            "failed to parse default route: {line}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_typical_route() {
        let (gateway, device) =
            parse_default_route("default via 192.168.1.1 dev eth0 proto dhcp metric 100\n")
                .unwrap();
        assert_eq!(gateway, "192.168.1.1");
        assert_eq!(device, "eth0");
    }

    #[test]
    fn test_parse_first_of_many() {
        let text = "default via 10.0.0.1 dev wlan0\ndefault via 172.16.0.1 dev eth1 metric 600\n";
        let (gateway, device) = parse_default_route(text).unwrap();
        assert_eq!(gateway, "10.0.0.1");
        assert_eq!(device, "wlan0");
    }

    #[test]
    fn test_parse_missing_gateway() {
        assert!(parse_default_route("default dev tun0 scope link\n").is_err());
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_default_route("").is_err());
        assert!(parse_default_route("\n  \n").is_err());
    }
}
