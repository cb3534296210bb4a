//! Per-machine private network identity and its netplan document.

use facet::Facet;
use rand_core::RngCore;

use crate::error::MachinaError;
use crate::spec::Network;

pub const SUBNET: &str = "192.168.122";
pub const NIC_NAME: &str = "virtnet";
const NAMESERVERS: [&str; 2] = ["1.1.1.1", "8.8.8.8"];

// ── netplan model ─────────────────────────────────────────

#[derive(Debug, Facet)]
struct NetplanDoc {
    ethernets: Ethernets,
    version: u32,
}

#[derive(Debug, Facet)]
struct Ethernets {
    virtnet: Ethernet,
}

#[derive(Debug, Facet)]
struct Ethernet {
    #[facet(rename = "set-name")]
    set_name: String,
    addresses: Vec<String>,
    dhcp4: bool,
    gateway4: String,
    #[facet(rename = "match")]
    matcher: MacMatch,
    nameservers: Nameservers,
}

#[derive(Debug, Facet)]
struct MacMatch {
    macaddress: String,
}

#[derive(Debug, Facet)]
struct Nameservers {
    addresses: Vec<String>,
}

// ── generation ────────────────────────────────────────────

/// Gateway of the subnet `ip` lives in: same first three octets, host `1`.
pub fn gateway_for(ip: &str) -> String {
    match ip.rsplit_once('.') {
        Some((subnet, _)) => format!("{subnet}.1"),
        None => format!("{SUBNET}.1"),
    }
}

/// Locally administered MAC under the `52:54:00` prefix.
pub fn random_mac<R: RngCore>(rng: &mut R) -> String {
    let mut buf = [0u8; 3];
    rng.fill_bytes(&mut buf);
    buf[0] |= 2;
    format!("52:54:00:{:02x}:{:02x}:{:02x}", buf[0], buf[1], buf[2])
}

/// Random address in `SUBNET`, host octet in `[10, 254)`. No collision
/// check against other machines.
pub fn random_ip<R: RngCore>(rng: &mut R) -> String {
    let host = 10 + rng.next_u32() % 244;
    format!("{SUBNET}.{host}")
}

/// Fresh identity for one machine.
pub fn generate<R: RngCore>(rng: &mut R) -> Network {
    let ip_address = random_ip(rng);
    Network {
        nic_name: NIC_NAME.into(),
        gateway: gateway_for(&ip_address),
        mac_address: random_mac(rng),
        ip_address,
    }
}

/// Netplan v2 document for `network`, written as `network.cfg`.
pub fn netplan(network: &Network) -> Result<String, MachinaError> {
    let doc = NetplanDoc {
        ethernets: Ethernets {
            virtnet: Ethernet {
                set_name: network.nic_name.clone(),
                addresses: vec![format!("{}/24", network.ip_address)],
                dhcp4: false,
                gateway4: network.gateway.clone(),
                matcher: MacMatch {
                    macaddress: network.mac_address.clone(),
                },
                nameservers: Nameservers {
                    addresses: NAMESERVERS.iter().map(|s| s.to_string()).collect(),
                },
            },
        },
        version: 2,
    };
    let yaml = facet_yaml::to_string(&doc).map_err(|e| MachinaError::Validation {
        message: format!("serializing network config: {e}"),
    })?;
    Ok(yaml.strip_prefix("---\n").unwrap_or(&yaml).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    /// Deterministic byte source for exact assertions.
    struct Fixed(u8);

    impl RngCore for Fixed {
        fn next_u32(&mut self) -> u32 {
            self.0 as u32
        }
        fn next_u64(&mut self) -> u64 {
            self.0 as u64
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(self.0);
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    #[test]
    fn host_octet_in_range() {
        for _ in 0..500 {
            let ip = random_ip(&mut OsRng);
            let host: u32 = ip.rsplit('.').next().unwrap().parse().unwrap();
            assert!((10..254).contains(&host), "host octet {host} out of range");
            assert!(ip.starts_with("192.168.122."));
        }
    }

    #[test]
    fn mac_sets_local_bit() {
        assert_eq!(random_mac(&mut Fixed(0)), "52:54:00:02:00:00");
        for _ in 0..100 {
            let mac = random_mac(&mut OsRng);
            assert!(mac.starts_with("52:54:00:"));
            let fourth = u8::from_str_radix(&mac[9..11], 16).unwrap();
            assert_eq!(fourth & 2, 2);
        }
    }

    #[test]
    fn gateway_shares_subnet() {
        assert_eq!(gateway_for("192.168.122.57"), "192.168.122.1");
        let net = generate(&mut Fixed(5));
        assert_eq!(net.ip_address, "192.168.122.15");
        assert_eq!(net.gateway, "192.168.122.1");
        assert_eq!(net.nic_name, "virtnet");
    }

    #[test]
    fn netplan_carries_identity() {
        let net = Network {
            nic_name: "virtnet".into(),
            ip_address: "192.168.122.40".into(),
            gateway: "192.168.122.1".into(),
            mac_address: "52:54:00:aa:bb:cc".into(),
        };
        let doc = netplan(&net).unwrap();
        assert!(!doc.starts_with("---"));
        for needle in [
            "set-name",
            "virtnet",
            "192.168.122.40/24",
            "gateway4",
            "macaddress",
            "52:54:00:aa:bb:cc",
            "1.1.1.1",
            "8.8.8.8",
        ] {
            assert!(doc.contains(needle), "missing {needle} in:\n{doc}");
        }
        assert!(doc.contains("version: 2"));
    }
}
