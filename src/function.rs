use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Notify, RwLock};
use uuid::Uuid;

/// Single-shot boot latch, per spec §9 design note: a small object
/// `{done, waiters}` protected by the function lock. `try_become_leader`
/// atomically flips `false → true`; whichever caller sees that flip is the
/// one boot attempt's leader, every other concurrent caller is a follower
/// that waits on `wait_for_boot`. `rearm` resets it after a teardown so the
/// next cold call gets to lead again.
///
/// Followers call `notified()` and `enable()` the result *before*
/// re-checking whether an instance is already present, mirroring `capsa`'s
/// pool `reserve()` pattern, so a `notify_waiters()` that fires between the
/// check and the wait is never missed.
#[derive(Debug, Default)]
pub struct BootLatch {
    booting: std::sync::Mutex<bool>,
    notify: Notify,
}

impl BootLatch {
    pub fn new() -> Self {
        BootLatch::default()
    }

    /// Returns `true` if this call became the boot leader.
    pub fn try_become_leader(&self) -> bool {
        let mut booting = self.booting.lock().unwrap();
        if *booting {
            false
        } else {
            *booting = true;
            true
        }
    }

    /// Returns a future for the next `rearm`/wake. The caller must pin it
    /// and call `enable()` before re-checking the instance list, or the
    /// wakeup isn't actually registered until the future is first polled.
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    /// Resets the latch to its idle state and wakes every waiter, so the
    /// next `Serve` (or the one that just lost the race) re-evaluates
    /// whether a boot is still needed.
    pub fn rearm(&self) {
        *self.booting.lock().unwrap() = false;
        self.notify.notify_waiters();
    }

    pub fn is_booting(&self) -> bool {
        *self.booting.lock().unwrap()
    }
}

/// `{fID, imageName, instances, isPinned, servedCount, startedCount,
/// bootLatch}` of spec §3. `instances` holds only `vmID`s; the Registry is
/// the sole owner of the `Vm` records (spec §9 "Cyclic/back references").
///
/// The minimal design keeps `len(instances) ∈ {0, 1}`; cross-instance load
/// balancing is intentionally left open (spec §9 "Open questions").
#[derive(Debug)]
pub struct Function {
    pub fid: String,
    pub image_name: String,
    pub is_pinned: bool,
    instances: RwLock<VecDeque<Uuid>>,
    served: AtomicU64,
    started: AtomicU64,
    served_since_boot: AtomicU64,
    boot_latch: BootLatch,
}

impl Function {
    /// A function is pinned when its id parses as a number in
    /// `[1, pinned_func_num]`; non-numeric ids are never pinned, matching
    /// seed scenario S4.
    pub fn new(fid: String, image_name: String, pinned_func_num: u64) -> Self {
        let is_pinned = fid
            .parse::<u64>()
            .map(|n| n >= 1 && n <= pinned_func_num)
            .unwrap_or(false);
        Function {
            fid,
            image_name,
            is_pinned,
            instances: RwLock::new(VecDeque::new()),
            served: AtomicU64::new(0),
            started: AtomicU64::new(0),
            served_since_boot: AtomicU64::new(0),
            boot_latch: BootLatch::new(),
        }
    }

    pub async fn current_instance(&self) -> Option<Uuid> {
        self.instances.read().await.front().copied()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    pub async fn push_instance(&self, vm_id: Uuid) {
        self.instances.write().await.push_back(vm_id);
        self.started.fetch_add(1, Ordering::SeqCst);
        self.served_since_boot.store(0, Ordering::SeqCst);
    }

    pub async fn pop_instance(&self) -> Option<Uuid> {
        self.instances.write().await.pop_front()
    }

    pub fn record_served(&self) -> u64 {
        self.served.fetch_add(1, Ordering::SeqCst);
        self.served_since_boot.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn served_count(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }

    pub fn started_count(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    pub fn boot_latch(&self) -> &BootLatch {
        &self.boot_latch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_status_numeric_within_range() {
        let f = Function::new("2".to_string(), "helloworld".to_string(), 2);
        assert!(f.is_pinned);
        let f = Function::new("3".to_string(), "helloworld".to_string(), 2);
        assert!(!f.is_pinned);
    }

    #[test]
    fn pin_status_non_numeric_never_pinned() {
        let f = Function::new("not_cld".to_string(), "helloworld".to_string(), 2);
        assert!(!f.is_pinned);
    }

    #[tokio::test]
    async fn boot_latch_only_one_leader() {
        let latch = BootLatch::new();
        assert!(latch.try_become_leader());
        assert!(!latch.try_become_leader());
        latch.rearm();
        assert!(latch.try_become_leader());
    }

    #[tokio::test]
    async fn served_since_boot_resets_on_new_instance() {
        let f = Function::new("9".to_string(), "helloworld".to_string(), 0);
        f.push_instance(Uuid::new_v4()).await;
        assert_eq!(f.record_served(), 1);
        assert_eq!(f.record_served(), 2);
        f.push_instance(Uuid::new_v4()).await;
        assert_eq!(f.record_served(), 1);
        assert_eq!(f.served_count(), 3);
    }
}
