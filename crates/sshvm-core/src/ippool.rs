//! IPv4 address allocation for guest VMs.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use anyhow::{bail, Result};
use ipnetwork::Ipv4Network;

/// Hands out guest addresses from the VM CIDR.
///
/// The network address, the broadcast address, and the gateway (first host,
/// assigned to the bridge) are never allocatable. Allocation is
/// deterministic: the lowest free address wins.
pub struct IpPool {
    network: Ipv4Network,
    gateway: Ipv4Addr,
    available: Vec<Ipv4Addr>,
    allocated: Mutex<HashSet<Ipv4Addr>>,
}

impl IpPool {
    pub fn new(network: Ipv4Network) -> Result<Self> {
        let size = network.size();
        let Some(gateway) = network.nth(1) else {
            bail!("no allocatable addresses in network {network}");
        };

        // Skip index 0 (network), 1 (gateway), and size-1 (broadcast).
        let available: Vec<Ipv4Addr> = (2..size.saturating_sub(1))
            .filter_map(|i| network.nth(i))
            .collect();
        if available.is_empty() {
            bail!("no allocatable addresses in network {network}");
        }

        Ok(Self {
            network,
            gateway,
            available,
            allocated: Mutex::new(HashSet::new()),
        })
    }

    /// Allocate the lowest free address, or fail when the pool is exhausted.
    pub fn allocate(&self) -> Result<Ipv4Addr> {
        let mut allocated = self.allocated.lock().expect("ip pool lock poisoned");
        for ip in &self.available {
            if !allocated.contains(ip) {
                allocated.insert(*ip);
                return Ok(*ip);
            }
        }
        bail!("no available IP addresses in network {}", self.network)
    }

    /// Return an address to the pool. Releasing an address that was never
    /// allocated is a no-op.
    pub fn release(&self, ip: Ipv4Addr) {
        self.allocated
            .lock()
            .expect("ip pool lock poisoned")
            .remove(&ip);
    }

    pub fn is_allocated(&self, ip: Ipv4Addr) -> bool {
        self.allocated
            .lock()
            .expect("ip pool lock poisoned")
            .contains(&ip)
    }

    /// Number of currently free addresses.
    pub fn available(&self) -> usize {
        let allocated = self.allocated.lock().expect("ip pool lock poisoned");
        self.available.len() - allocated.len()
    }

    /// Gateway address: the first host of the network, assigned to the bridge.
    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.network.mask()
    }

    pub fn network(&self) -> Ipv4Network {
        self.network
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(cidr: &str) -> IpPool {
        IpPool::new(cidr.parse().unwrap()).unwrap()
    }

    #[test]
    fn test_available_counts() {
        // 254 hosts minus the gateway.
        assert_eq!(pool("192.168.100.0/24").available(), 253);
        // /28: 14 hosts minus the gateway.
        assert_eq!(pool("192.168.100.0/28").available(), 13);
        // /30: 2 hosts minus the gateway.
        assert_eq!(pool("192.168.100.0/30").available(), 1);
    }

    #[test]
    fn test_rejects_networks_without_hosts() {
        assert!(IpPool::new("192.168.100.0/31".parse().unwrap()).is_err());
        assert!(IpPool::new("192.168.100.1/32".parse().unwrap()).is_err());
    }

    #[test]
    fn test_gateway_and_netmask() {
        let p = pool("192.168.100.0/24");
        assert_eq!(p.gateway(), "192.168.100.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(p.netmask(), "255.255.255.0".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_allocates_lowest_free_first() {
        let p = pool("192.168.100.0/24");
        assert_eq!(p.allocate().unwrap().to_string(), "192.168.100.2");
        assert_eq!(p.allocate().unwrap().to_string(), "192.168.100.3");
    }

    #[test]
    fn test_allocate_release_roundtrip() {
        let p = pool("192.168.100.0/28");
        let total = p.available();
        let ip = p.allocate().unwrap();
        assert!(p.is_allocated(ip));
        assert_eq!(p.available(), total - 1);

        p.release(ip);
        assert!(!p.is_allocated(ip));
        assert_eq!(p.available(), total);

        // The released address is immediately reusable.
        assert_eq!(p.allocate().unwrap(), ip);
    }

    #[test]
    fn test_release_of_unallocated_is_noop() {
        let p = pool("192.168.100.0/28");
        let total = p.available();
        p.release("192.168.100.9".parse().unwrap());
        assert_eq!(p.available(), total);
    }

    #[test]
    fn test_exhaustion() {
        let p = pool("192.168.100.0/29");
        // 6 hosts minus the gateway.
        assert_eq!(p.available(), 5);

        let mut ips = Vec::new();
        for _ in 0..5 {
            ips.push(p.allocate().unwrap());
        }
        assert!(p.allocate().is_err());

        p.release(ips[2]);
        assert_eq!(p.allocate().unwrap(), ips[2]);
    }

    #[test]
    fn test_allocated_plus_available_is_total() {
        let p = pool("192.168.100.0/28");
        let total = p.available();
        let a = p.allocate().unwrap();
        let _b = p.allocate().unwrap();
        assert_eq!(p.available() + 2, total);
        p.release(a);
        assert_eq!(p.available() + 1, total);
    }
}
