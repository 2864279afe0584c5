//! Server host-network configuration: IP forwarding and NAT for the VPN
//! subnet.
//!
//! Setup is idempotent (rules are probed with `iptables -C` before being
//! added) and records exactly what it changed; cleanup reverses those
//! changes in LIFO order, best-effort, and restores the forwarding flag
//! only if this process flipped it.

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::VPN_SUBNET;

const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

/// One iptables rule, with the operation used to install it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FirewallRule {
    table: &'static str,
    chain: &'static str,
    args: Vec<String>,
    /// Insert at the head of the chain instead of appending.
    insert: bool,
}

impl FirewallRule {
    fn command_args(&self, operation: &str) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table.to_string(),
            operation.to_string(),
            self.chain.to_string(),
        ];
        args.extend(self.args.iter().cloned());
        args
    }

    fn render(&self) -> String {
        format!("-t {} {} {}", self.table, self.chain, self.args.join(" "))
    }
}

/// Manages the server's forwarding flag and firewall rules.
pub struct NetworkManager {
    external_interface: String,
    ip_forward_was_on: bool,
    rules_added: Vec<FirewallRule>,
}

impl NetworkManager {
    /// Detect the egress interface from the default route.
    pub async fn detect() -> Result<Self> {
        let external_interface = egress_interface().await?;
        Ok(Self {
            external_interface,
            ip_forward_was_on: false,
            rules_added: Vec::new(),
        })
    }

    /// The detected egress interface.
    pub fn external_interface(&self) -> &str {
        &self.external_interface
    }

    /// Enable forwarding and ensure the NAT and FORWARD rules exist.
    pub async fn setup(&mut self) -> Result<()> {
        self.enable_ip_forwarding().await?;

        for rule in planned_rules(&self.external_interface) {
            if rule_exists(&rule).await {
                debug!(rule = rule.render(), "firewall rule already present");
                continue;
            }
            apply_rule(&rule).await?;
            debug!(rule = rule.render(), "firewall rule added");
            self.rules_added.push(rule);
        }

        info!(
            egress = %self.external_interface,
            "network configured: IP forwarding on, NAT for {VPN_SUBNET}"
        );
        Ok(())
    }

    /// Remove the rules this process added and restore the forwarding flag.
    /// Best-effort: failures are logged and cleanup continues.
    pub async fn cleanup(&mut self) {
        while let Some(rule) = self.rules_added.pop() {
            if let Err(err) = delete_rule(&rule).await {
                warn!(rule = rule.render(), error = %err, "failed to remove firewall rule");
            }
        }

        if !self.ip_forward_was_on {
            match write_ip_forward("0").await {
                Ok(()) => info!("IP forwarding disabled"),
                Err(err) => warn!(error = %err, "failed to restore IP forwarding"),
            }
        }

        info!("network settings restored");
    }

    async fn enable_ip_forwarding(&mut self) -> Result<()> {
        let current = tokio::fs::read_to_string(IP_FORWARD_PATH)
            .await
            .map_err(|e| Error::platform(format!("cannot read {IP_FORWARD_PATH}: {e}")))?;

        self.ip_forward_was_on = current.trim() == "1";
        if self.ip_forward_was_on {
            debug!("IP forwarding already enabled");
            return Ok(());
        }

        write_ip_forward("1").await?;
        info!("IP forwarding enabled");
        Ok(())
    }
}

/// The three rules the VPN subnet needs: masquerade on egress, and both
/// FORWARD directions accepted. FORWARD rules are inserted at the head so a
/// restrictive default policy cannot shadow them.
fn planned_rules(external_interface: &str) -> Vec<FirewallRule> {
    vec![
        FirewallRule {
            table: "nat",
            chain: "POSTROUTING",
            insert: false,
            args: vec![
                "-s".to_string(),
                VPN_SUBNET.to_string(),
                "-o".to_string(),
                external_interface.to_string(),
                "-j".to_string(),
                "MASQUERADE".to_string(),
            ],
        },
        FirewallRule {
            table: "filter",
            chain: "FORWARD",
            insert: true,
            args: vec![
                "-s".to_string(),
                VPN_SUBNET.to_string(),
                "-j".to_string(),
                "ACCEPT".to_string(),
            ],
        },
        FirewallRule {
            table: "filter",
            chain: "FORWARD",
            insert: true,
            args: vec![
                "-d".to_string(),
                VPN_SUBNET.to_string(),
                "-j".to_string(),
                "ACCEPT".to_string(),
            ],
        },
    ]
}

async fn rule_exists(rule: &FirewallRule) -> bool {
    Command::new("iptables")
        .args(rule.command_args("-C"))
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}

async fn apply_rule(rule: &FirewallRule) -> Result<()> {
    let operation = if rule.insert { "-I" } else { "-A" };
    let output = Command::new("iptables")
        .args(rule.command_args(operation))
        .output()
        .await?;

    if !output.status.success() {
        return Err(Error::platform(format!(
            "iptables {} {} failed: {}",
            operation,
            rule.render(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Delete a rule, swallowing the missing-rule error iptables reports when
/// the rule is already gone.
async fn delete_rule(rule: &FirewallRule) -> Result<()> {
    let output = Command::new("iptables")
        .args(rule.command_args("-D"))
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.contains("does a matching rule exist") {
            return Err(Error::platform(format!(
                "iptables -D {} failed: {}",
                rule.render(),
                stderr.trim()
            )));
        }
    }
    Ok(())
}

async fn write_ip_forward(value: &str) -> Result<()> {
    tokio::fs::write(IP_FORWARD_PATH, value)
        .await
        .map_err(|e| Error::platform(format!("cannot write {IP_FORWARD_PATH}: {e}")))
}

/// Recover the egress device from `ip route show default`.
async fn egress_interface() -> Result<String> {
    let output = Command::new("ip")
        .args(["route", "show", "default"])
        .output()
        .await?;

    if !output.status.success() {
        return Err(Error::platform("ip route show default failed"));
    }

    parse_egress_interface(&String::from_utf8_lossy(&output.stdout))
}

fn parse_egress_interface(text: &str) -> Result<String> {
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| Error::platform("no default route found"))?;

    let fields: Vec<&str> = line.split_whitespace().collect();
    for pair in fields.windows(2) {
        if pair[0] == "dev" {
            return Ok(pair[1].to_string());
        }
    }

    Err(Error::platform(format!(
        "failed to parse default route: {line}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_egress_interface() {
        assert_eq!(
            parse_egress_interface("default via 192.168.1.1 dev eth0 proto dhcp\n").unwrap(),
            "eth0"
        );
        assert!(parse_egress_interface("").is_err());
        assert!(parse_egress_interface("default via 192.168.1.1\n").is_err());
    }

    #[test]
    fn test_planned_rules_cover_the_subnet() {
        let rules = planned_rules("eth0");
        assert_eq!(rules.len(), 3);

        let nat = &rules[0];
        assert_eq!(nat.table, "nat");
        assert_eq!(nat.chain, "POSTROUTING");
        assert!(!nat.insert);
        assert!(nat.args.contains(&VPN_SUBNET.to_string()));
        assert!(nat.args.contains(&"eth0".to_string()));
        assert!(nat.args.contains(&"MASQUERADE".to_string()));

        // Both FORWARD directions, inserted at the head of the chain.
        assert!(rules[1..].iter().all(|r| r.chain == "FORWARD" && r.insert));
        assert!(rules[1].args.contains(&"-s".to_string()));
        assert!(rules[2].args.contains(&"-d".to_string()));
    }

    #[test]
    fn test_planned_rules_are_deterministic() {
        // Running setup twice plans the same rules, so the existence probe
        // makes the second run a no-op.
        assert_eq!(planned_rules("wan0"), planned_rules("wan0"));
    }

    #[test]
    fn test_rule_command_args() {
        let rule = &planned_rules("eth0")[0];
        let args = rule.command_args("-C");
        assert_eq!(&args[..4], &["-t", "nat", "-C", "POSTROUTING"]);
        assert_eq!(args[4..].join(" "), rule.args.join(" "));
    }
}
