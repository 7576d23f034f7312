//! VIP allocator.
//!
//! Scans the configured ranges in declaration order and hands out the
//! first address that is neither a network base address nor already used
//! by a service. The cursor restarts from the beginning after every call.

use crate::error::{Error, Result};
use crate::model::{Service, State};
use arc_swap::ArcSwap;
use cidr::Ipv4Cidr;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long an allocation is held back while its service propagates.
const PENDING_TTL: Duration = Duration::from_secs(60);

/// Assigns virtual addresses to new services.
pub struct VipAllocator {
    /// Address pools, swappable on config reload.
    ranges: ArcSwap<Vec<Ipv4Cidr>>,
    state: Arc<State>,
    cursor: Mutex<Cursor>,
    /// Addresses handed out whose service has not reached the state model yet.
    pending: Mutex<HashMap<Ipv4Addr, Instant>>,
}

/// Position within the concatenation of all ranges.
#[derive(Debug, Default)]
struct Cursor {
    range: usize,
    offset: u64,
}

impl Cursor {
    /// Next address and whether it is the base address of its range.
    fn next(&mut self, ranges: &[Ipv4Cidr]) -> Option<(Ipv4Addr, bool)> {
        loop {
            let range = ranges.get(self.range)?;
            let size = 1u64 << (32 - u32::from(range.network_length()));
            if self.offset < size {
                let base = u32::from(range.first_address());
                let address = Ipv4Addr::from(base.wrapping_add(self.offset as u32));
                let is_base = self.offset == 0;
                self.offset += 1;
                return Some((address, is_base));
            }
            self.range += 1;
            self.offset = 0;
        }
    }

    fn reset(&mut self) {
        self.range = 0;
        self.offset = 0;
    }
}

impl VipAllocator {
    pub fn new(ranges: Vec<Ipv4Cidr>, state: Arc<State>) -> Self {
        Self {
            ranges: ArcSwap::from_pointee(ranges),
            state,
            cursor: Mutex::new(Cursor::default()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the address pools. Existing services keep their addresses.
    pub fn set_ranges(&self, ranges: Vec<Ipv4Cidr>) {
        info!(ranges = ranges.len(), "vip ranges updated");
        self.ranges.store(Arc::new(ranges));
        self.cursor.lock().reset();
    }

    /// Assign a free address to `svc.address` and return it.
    pub fn allocate_vip(&self, svc: &mut Service) -> Result<Ipv4Addr> {
        let ranges = self.ranges.load();
        if ranges.is_empty() {
            warn!(service = %svc.name, "no vip ranges configured");
            return Err(Error::NoAddressAvailable);
        }

        let used: HashSet<Ipv4Addr> = self.state.snapshot().vips().collect();
        let mut pending = self.pending.lock();
        pending.retain(|address, at| !used.contains(address) && at.elapsed() < PENDING_TTL);

        let mut cursor = self.cursor.lock();
        let found = loop {
            match cursor.next(&ranges) {
                None => break None,
                Some((_, true)) => continue,
                Some((address, false)) => {
                    if !used.contains(&address) && !pending.contains_key(&address) {
                        break Some(address);
                    }
                }
            }
        };
        cursor.reset();

        match found {
            Some(address) => {
                pending.insert(address, Instant::now());
                svc.address = Some(address);
                debug!(service = %svc.name, vip = %address, "allocated vip");
                Ok(address)
            }
            None => {
                warn!(service = %svc.name, "vip ranges exhausted");
                Err(Error::NoAddressAvailable)
            }
        }
    }

    /// Return the address of `svc` to the pool.
    ///
    /// Addresses of services in the state model become free again once the
    /// service is deleted; this only forgets a not yet committed allocation.
    pub fn release_vip(&self, svc: &Service) {
        if let Some(address) = svc.address {
            if self.pending.lock().remove(&address).is_some() {
                debug!(service = %svc.name, vip = %address, "released pending vip");
            }
        }
    }
}
