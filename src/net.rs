use anyhow::{Result, anyhow};
use if_addrs::{IfAddr, Interface};
use std::net::Ipv4Addr;

fn ipv4_of(iface: &Interface) -> Option<Ipv4Addr> {
    match iface.addr {
        IfAddr::V4(ref v4) => Some(v4.ip),
        IfAddr::V6(_) => None,
    }
}

fn looks_wireless(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.contains("wlan") || lower.contains("wifi") || lower.contains("wireless")
}

/// Picks the interface the PTP helper should bind to: the first non-loopback, IPv4-bearing
/// interface, preferring a wired one over anything that looks wireless by name.
pub fn get_default_interface() -> Result<(String, Ipv4Addr)> {
    let interfaces = if_addrs::get_if_addrs().map_err(|e| anyhow!("failed to enumerate network interfaces: {e}"))?;
    let usable: Vec<&Interface> = interfaces.iter().filter(|iface| !iface.is_loopback()).collect();

    if usable.is_empty() {
        log::warn!("No suitable network interface found. Diagnostics:");
        for iface in &interfaces {
            log::warn!(" - Name: '{}', Loopback: {}, Addr: {:?}", iface.name, iface.is_loopback(), iface.addr);
        }
        return Err(anyhow!("No suitable network interface found"));
    }

    let mut best: Option<(&str, Ipv4Addr)> = None;

    for iface in &usable {
        let Some(ip) = ipv4_of(iface) else { continue };

        if !looks_wireless(&iface.name) {
            return Ok((iface.name.clone(), ip));
        }
        if best.is_none() {
            best = Some((&iface.name, ip));
        }
    }

    match best {
        Some((name, ip)) => Ok((name.to_string(), ip)),
        None => {
            log::warn!("No suitable network interface found. Diagnostics:");
            for iface in &interfaces {
                log::warn!(" - Name: '{}', Loopback: {}, Addr: {:?}", iface.name, iface.is_loopback(), iface.addr);
            }
            Err(anyhow!("No suitable network interface found"))
        }
    }
}