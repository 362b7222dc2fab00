// Linux address configuration through iproute2

use super::AddressConfigurator;
use anyhow::{Context, Result, anyhow};
use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::process::Command;

/// Configures addresses with `ip -6 addr replace ... nodad`
pub struct IpCommandConfigurator {
    sys_class_net: PathBuf,
}

impl Default for IpCommandConfigurator {
    fn default() -> Self {
        Self {
            sys_class_net: PathBuf::from("/sys/class/net"),
        }
    }
}

impl IpCommandConfigurator {
    /// Check if iproute2 is available
    pub fn check_available() -> bool {
        Command::new("ip").arg("-V").output().is_ok()
    }
}

fn replace_args(link: &str, addr: Ipv6Addr, prefix_len: u8) -> Vec<String> {
    vec![
        "-6".to_string(),
        "addr".to_string(),
        "replace".to_string(),
        format!("{}/{}", addr, prefix_len),
        "dev".to_string(),
        link.to_string(),
        "nodad".to_string(),
    ]
}

impl AddressConfigurator for IpCommandConfigurator {
    fn name(&self) -> &'static str {
        "ip"
    }

    fn link_exists(&self, link: &str) -> bool {
        !link.is_empty() && !link.contains('/') && self.sys_class_net.join(link).exists()
    }

    fn replace_address(&self, link: &str, addr: Ipv6Addr, prefix_len: u8) -> Result<()> {
        let args = replace_args(link, addr, prefix_len);
        log::debug!("Running: ip {}", args.join(" "));

        let output = Command::new("ip")
            .args(&args)
            .output()
            .context("Failed to run ip")?;

        if !output.status.success() {
            return Err(anyhow!(
                "Failed to add {}/{} to {}: {}",
                addr,
                prefix_len,
                link,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}
