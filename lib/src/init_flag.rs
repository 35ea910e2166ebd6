//! One-shot initialisation flags.
//!
//! An [`InitFlag`] hands out exactly one successful `claim()` until it is
//! `reset()`. Used to guard one-time setup such as arena initialisation or
//! claiming a device instance.

use core::sync::atomic::{AtomicBool, Ordering};

pub struct InitFlag {
    claimed: AtomicBool,
}

impl InitFlag {
    #[inline]
    pub const fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
        }
    }

    /// Attempt to claim the flag. Returns true for exactly one caller.
    #[inline]
    pub fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the flag so it can be claimed again.
    #[inline]
    pub fn reset(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

impl Default for InitFlag {
    fn default() -> Self {
        Self::new()
    }
}
