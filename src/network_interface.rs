use crate::error::{OrchestratorError, Result};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

/// Default deadline for [`NiPool::allocate`], matching the 10s timeout used
/// by the original NI pool.
pub const DEFAULT_ALLOCATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed subnet the whole NI pool is carved out of. Addressing is statically
/// pre-computed, per spec Non-goals (no dynamic IP allocation).
pub const SUBNET: &str = "255.255.255.0";

/// Immutable, pre-provisioned network identity. Identity is `host_dev_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub mac_address: String,
    pub host_dev_name: String,
    pub primary_address: IpAddr,
    pub subnet: String,
    pub gateway_address: IpAddr,
}

fn make_mac(i: u32) -> String {
    format!("02:FC:00:00:{:02X}:{:02X}", (i / 256) % 256, i % 256)
}

fn make_tap_name(i: u32) -> String {
    format!("fc-{i}-tap0")
}

/// `192.168.<(i+2)/256>.<(i+2)%256>` keeps every generated address inside
/// the private 192.168.0.0/16 range regardless of pool size.
fn make_primary_address(i: u32) -> IpAddr {
    let idx = i + 2;
    IpAddr::V4(Ipv4Addr::new(192, 168, (idx / 256) as u8, (idx % 256) as u8))
}

fn make_gateway_address(bridge_index: u32) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, (bridge_index / 256) as u8, (bridge_index % 256) as u8))
}

impl NetworkInterface {
    /// Deterministically synthesises the `i`-th interface of a pool, per
    /// spec §4.1.
    pub fn synthesize(i: u32, taps_per_bridge: u32) -> Self {
        NetworkInterface {
            mac_address: make_mac(i),
            host_dev_name: make_tap_name(i),
            primary_address: make_primary_address(i),
            subnet: SUBNET.to_string(),
            gateway_address: make_gateway_address(i / taps_per_bridge.max(1)),
        }
    }
}

/// A bounded, blocking pool of pre-generated [`NetworkInterface`] records.
/// `Allocate` blocks (with a timeout) until one is free; `Free` returns it.
/// FIFO reuse lowers host-NIC ARP churn; concurrent allocate/free are
/// linearisable via the semaphore + mutex-guarded free list.
#[derive(Debug)]
pub struct NiPool {
    semaphore: Arc<Semaphore>,
    free_list: Mutex<VecDeque<NetworkInterface>>,
}

impl NiPool {
    /// Synthesises `n` interfaces and constructs the pool around them.
    pub fn new(n: usize, taps_per_bridge: u32) -> Self {
        debug!(n, "creating network interface pool");
        let free_list = (0..n as u32)
            .map(|i| NetworkInterface::synthesize(i, taps_per_bridge))
            .collect();
        NiPool {
            semaphore: Arc::new(Semaphore::new(n)),
            free_list: Mutex::new(free_list),
        }
    }

    /// Acquires one unit of the pool's capacity and pops the head of the
    /// free list. Fails with `ResourceExhausted` if no interface becomes
    /// free within `timeout`.
    pub async fn allocate(&self, timeout: Duration) -> Result<NetworkInterface> {
        let permit = tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| OrchestratorError::ResourceExhausted)?
            .expect("NiPool semaphore is never closed");
        permit.forget();

        let mut free_list = self.free_list.lock().await;
        let ni = free_list
            .pop_front()
            .expect("semaphore permit implies a free interface is present");
        debug!(ip = %ni.primary_address, "allocated network interface");
        Ok(ni)
    }

    /// Returns `ni` to the tail of the free list and releases one semaphore
    /// unit. Callers must free exactly once; freeing twice double-counts
    /// capacity.
    pub async fn free(&self, ni: NetworkInterface) {
        debug!(ip = %ni.primary_address, "freed network interface");
        self.free_list.lock().await.push_back(ni);
        self.semaphore.add_permits(1);
    }

    /// Number of interfaces currently free. A snapshot, may be stale under
    /// concurrent allocate/free.
    pub async fn available_count(&self) -> usize {
        self.free_list.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesis_matches_original_scheme() {
        let ni = NetworkInterface::synthesize(0, 256);
        assert_eq!(ni.mac_address, "02:FC:00:00:00:00");
        assert_eq!(ni.host_dev_name, "fc-0-tap0");
        assert_eq!(ni.gateway_address, make_gateway_address(0));

        let ni = NetworkInterface::synthesize(257, 256);
        assert_eq!(ni.mac_address, "02:FC:00:00:01:01");
        assert_eq!(ni.host_dev_name, "fc-257-tap0");
        assert_eq!(ni.gateway_address, make_gateway_address(1));
    }

    #[tokio::test]
    async fn allocate_and_free_round_trip() {
        let pool = NiPool::new(2, 256);
        let a = pool.allocate(DEFAULT_ALLOCATE_TIMEOUT).await.unwrap();
        let b = pool.allocate(DEFAULT_ALLOCATE_TIMEOUT).await.unwrap();
        assert_ne!(a.host_dev_name, b.host_dev_name);
        assert_eq!(pool.available_count().await, 0);

        pool.free(a.clone()).await;
        assert_eq!(pool.available_count().await, 1);
        let c = pool.allocate(DEFAULT_ALLOCATE_TIMEOUT).await.unwrap();
        assert_eq!(c.host_dev_name, a.host_dev_name);

        pool.free(b).await;
        pool.free(c).await;
    }

    #[tokio::test]
    async fn allocate_times_out_when_exhausted() {
        let pool = NiPool::new(1, 256);
        let _ni = pool.allocate(DEFAULT_ALLOCATE_TIMEOUT).await.unwrap();
        let err = pool
            .allocate(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ResourceExhausted));
    }
}
