//! Size Accountant Module
//!
//! Running total of resident payload bytes, checked against the configured
//! maximum and the eviction target (`max * cap`).
//!
//! The total is kept signed: a removal can be accounted before the write
//! that created the entry, leaving a short-lived debit that the write's own
//! update cancels. Reads report a debit as zero.

use parking_lot::Mutex;

// == Size Accountant ==
#[derive(Debug)]
pub struct SizeAccountant {
    current: Mutex<i64>,
    max_size_bytes: u64,
    target_bytes: u64,
}

impl SizeAccountant {
    // == Constructor ==
    /// Creates an accountant starting at `initial` resident bytes.
    ///
    /// # Arguments
    /// * `max_size_bytes` - Ceiling that triggers eviction when exceeded
    /// * `target_ratio` - Fraction of the ceiling an eviction pass drives down to
    /// * `initial` - Bytes already resident in the store
    pub fn new(max_size_bytes: u64, target_ratio: f64, initial: u64) -> Self {
        let target_bytes = ((max_size_bytes as f64) * target_ratio).floor() as u64;
        Self {
            current: Mutex::new(clamp_to_i64(initial)),
            max_size_bytes,
            target_bytes: target_bytes.min(max_size_bytes),
        }
    }

    // == Account ==
    /// Applies a signed change to the running total.
    pub fn account(&self, delta_bytes: i64) -> u64 {
        let mut current = self.current.lock();
        *current = current.saturating_add(delta_bytes);
        clamp_to_u64(*current)
    }

    /// Subtracts removed bytes.
    pub fn release(&self, bytes: u64) -> u64 {
        self.account(-clamp_to_i64(bytes))
    }

    // == Queries ==
    /// True if the total is above the maximum.
    pub fn over_limit(&self) -> bool {
        self.current() > self.max_size_bytes
    }

    /// Bytes still to be freed to reach the eviction target, if any.
    pub fn excess_over_target(&self) -> Option<u64> {
        let current = self.current();
        (current > self.target_bytes).then(|| current - self.target_bytes)
    }

    /// Resident bytes, with a transient debit reported as zero.
    pub fn current(&self) -> u64 {
        clamp_to_u64(*self.current.lock())
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    pub fn target_bytes(&self) -> u64 {
        self.target_bytes
    }
}

fn clamp_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn clamp_to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_target_from_ratio() {
        let acct = SizeAccountant::new(1000, 0.5, 0);
        assert_eq!(acct.target_bytes(), 500);
        assert_eq!(acct.max_size_bytes(), 1000);

        let acct = SizeAccountant::new(1000, 1.0, 0);
        assert_eq!(acct.target_bytes(), 1000);
    }

    #[test]
    fn test_debit_reads_as_zero_and_is_cancelled() {
        let acct = SizeAccountant::new(1000, 0.5, 10);
        assert_eq!(acct.release(50), 0);
        assert_eq!(acct.current(), 0);
        assert_eq!(acct.excess_over_target(), None);

        // the write that created the released bytes lands afterwards
        assert_eq!(acct.account(40), 0);
        assert_eq!(acct.account(30), 30);
    }

    #[test]
    fn test_over_limit() {
        let acct = SizeAccountant::new(100, 0.5, 90);
        assert!(!acct.over_limit());

        acct.account(10);
        assert!(!acct.over_limit());

        acct.account(11);
        assert!(acct.over_limit());
    }

    #[test]
    fn test_excess_over_target() {
        let acct = SizeAccountant::new(100, 0.5, 50);
        assert_eq!(acct.excess_over_target(), None);
        acct.account(20);
        assert_eq!(acct.excess_over_target(), Some(20));
    }

    #[test]
    fn test_concurrent_accounting_is_consistent() {
        let acct = Arc::new(SizeAccountant::new(u64::MAX, 1.0, 0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let acct = Arc::clone(&acct);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        acct.account(3);
                        acct.account(-1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(acct.current(), 8 * 1000 * 2);
    }
}
