//! Overlay address pool over `gateway/24`

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use tracing::debug;

const FIRST_HOST: u8 = 2;
const LAST_HOST: u8 = 254;

/// Leases host addresses `.2`..=`.254`, never the gateway itself
#[derive(Debug)]
pub struct IpPool {
    gateway: Ipv4Addr,
    leased: Mutex<BTreeSet<u8>>,
}

impl IpPool {
    pub fn new(gateway: Ipv4Addr) -> Self {
        Self {
            gateway,
            leased: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    fn host(&self, last: u8) -> Ipv4Addr {
        let [a, b, c, _] = self.gateway.octets();
        Ipv4Addr::new(a, b, c, last)
    }

    /// Lowest free address, `None` when exhausted
    pub fn lease(&self) -> Option<Ipv4Addr> {
        let mut leased = self.leased.lock().unwrap_or_else(|p| p.into_inner());
        let gateway_host = self.gateway.octets()[3];

        let last = (FIRST_HOST..=LAST_HOST)
            .find(|host| *host != gateway_host && !leased.contains(host))?;
        leased.insert(last);

        let ip = self.host(last);
        debug!("Leased {}", ip);
        Some(ip)
    }

    pub fn release(&self, ip: Ipv4Addr) -> bool {
        let [a, b, c, last] = ip.octets();
        let [ga, gb, gc, _] = self.gateway.octets();
        if (a, b, c) != (ga, gb, gc) {
            return false;
        }
        let released = self
            .leased
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&last);
        if released {
            debug!("Released {}", ip);
        }
        released
    }

    pub fn leased_count(&self) -> usize {
        self.leased.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leases_lowest_free() {
        let pool = IpPool::new(Ipv4Addr::new(10, 8, 0, 1));
        assert_eq!(pool.lease(), Some(Ipv4Addr::new(10, 8, 0, 2)));
        assert_eq!(pool.lease(), Some(Ipv4Addr::new(10, 8, 0, 3)));
        assert_eq!(pool.lease(), Some(Ipv4Addr::new(10, 8, 0, 4)));

        assert!(pool.release(Ipv4Addr::new(10, 8, 0, 3)));
        assert_eq!(pool.lease(), Some(Ipv4Addr::new(10, 8, 0, 3)));
        assert_eq!(pool.leased_count(), 3);
    }

    #[test]
    fn test_skips_gateway() {
        let pool = IpPool::new(Ipv4Addr::new(172, 16, 5, 3));
        assert_eq!(pool.lease(), Some(Ipv4Addr::new(172, 16, 5, 2)));
        assert_eq!(pool.lease(), Some(Ipv4Addr::new(172, 16, 5, 4)));
    }

    #[test]
    fn test_exhaustion() {
        let pool = IpPool::new(Ipv4Addr::new(10, 8, 0, 1));
        for _ in 2..=254 {
            assert!(pool.lease().is_some());
        }
        assert_eq!(pool.lease(), None);

        assert!(pool.release(Ipv4Addr::new(10, 8, 0, 100)));
        assert_eq!(pool.lease(), Some(Ipv4Addr::new(10, 8, 0, 100)));
    }

    #[test]
    fn test_release_foreign_address() {
        let pool = IpPool::new(Ipv4Addr::new(10, 8, 0, 1));
        pool.lease();
        assert!(!pool.release(Ipv4Addr::new(10, 9, 0, 2)));
        assert!(!pool.release(Ipv4Addr::new(10, 8, 0, 77)));
        assert_eq!(pool.leased_count(), 1);
    }
}
