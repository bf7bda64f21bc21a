//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Facts about the host the bridge runs on."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Map, Value};

use crate::network::{AddressSource, NetTriple};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Software and uptime facts reported next to the controller's own status.
#[derive(Debug, Clone)]
pub struct HostFacts {
    version: String,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl HostFacts {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// `SWPI`, `OS`, `SWUP`, `SWBOOT`, `PIUP` and `PIBOOT` fields.
    pub fn collect(&self) -> Map<String, Value> {
        let os = fs::read_to_string("/etc/os-release")
            .ok()
            .and_then(|text| parse_os_release(&text))
            .unwrap_or_else(|| std::env::consts::OS.to_owned());
        let host_uptime = fs::read_to_string("/proc/uptime")
            .ok()
            .and_then(|text| parse_uptime(&text))
            .unwrap_or(0);
        let now = Utc::now();
        let host_boot = now - ChronoDuration::seconds(host_uptime as i64);

        let mut facts = Map::new();
        facts.insert("SWPI".into(), json!(self.version));
        facts.insert("OS".into(), json!(os));
        facts.insert("SWUP".into(), json!(self.started.elapsed().as_secs()));
        facts.insert(
            "SWBOOT".into(),
            json!(self.started_at.format(TIMESTAMP_FORMAT).to_string()),
        );
        facts.insert("PIUP".into(), json!(host_uptime));
        facts.insert(
            "PIBOOT".into(),
            json!(host_boot.format(TIMESTAMP_FORMAT).to_string()),
        );
        facts
    }
}

pub fn parse_os_release(text: &str) -> Option<String> {
    text.lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|value| value.trim().trim_matches('"').to_owned())
        .filter(|value| !value.is_empty())
}

pub fn parse_uptime(text: &str) -> Option<u64> {
    let seconds: f64 = text.split_whitespace().next()?.parse().ok()?;
    Some(seconds as u64)
}

/// Gateway of the default route in `/proc/net/route` (little-endian hex).
pub fn parse_default_gateway(text: &str) -> Option<Ipv4Addr> {
    text.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let destination = fields.get(1)?;
        let flags = u16::from_str_radix(fields.get(3)?, 16).ok()?;
        if *destination != "00000000" || flags & 0x2 == 0 {
            return None;
        }
        let raw = u32::from_str_radix(fields.get(2)?, 16).ok()?;
        Some(Ipv4Addr::from(raw.to_le_bytes()))
    })
}

pub fn parse_nameserver(text: &str) -> Option<Ipv4Addr> {
    text.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some(keyword) if keyword.eq_ignore_ascii_case("nameserver") => {
                parts.next()?.parse().ok()
            }
            _ => None,
        }
    })
}

/// Reads addressing from the running Linux host. Missing parts become `0.0.0.0`.
#[derive(Debug, Clone)]
pub struct HostAddresses {
    /// Used only to pick the outbound interface; nothing is sent.
    backend_host: String,
    backend_port: u16,
}

impl HostAddresses {
    pub fn new(backend_host: impl Into<String>, backend_port: u16) -> Self {
        Self {
            backend_host: backend_host.into(),
            backend_port,
        }
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
        socket
            .connect((self.backend_host.as_str(), self.backend_port))
            .ok()?;
        match socket.local_addr().ok()?.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        }
    }
}

impl AddressSource for HostAddresses {
    fn current(&self) -> NetTriple {
        let gateway = fs::read_to_string("/proc/net/route")
            .ok()
            .and_then(|text| parse_default_gateway(&text));
        let dns = fs::read_to_string("/etc/resolv.conf")
            .ok()
            .and_then(|text| parse_nameserver(&text));
        NetTriple {
            ip: self.local_ip().unwrap_or(Ipv4Addr::UNSPECIFIED),
            gateway: gateway.unwrap_or(Ipv4Addr::UNSPECIFIED),
            dns: dns.unwrap_or(Ipv4Addr::UNSPECIFIED),
        }
    }
}
