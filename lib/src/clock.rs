//! Monotonic clock behind a registered platform source.
//!
//! The protocol engine has no timer hardware of its own; the host kernel
//! registers a nanosecond counter (HPET, TSC, tick-derived — whatever it
//! has) during platform init.  Before registration every accessor returns
//! `0`, which callers must treat as "time not advancing yet".
//!
//! All functions are safe to call from any context (interrupt, kernel
//! thread, syscall handler).

use core::sync::atomic::{AtomicPtr, Ordering};

/// Signature of a platform clock source: monotonic nanoseconds since boot.
pub type ClockSource = fn() -> u64;

static SOURCE: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Register the platform clock source.  Replaces any previous source.
pub fn clock_register_source(source: ClockSource) {
    SOURCE.store(source as *mut (), Ordering::Release);
}

/// Returns the monotonic clock value in nanoseconds since boot.
///
/// Returns `0` if no platform source has been registered yet.
#[inline]
pub fn monotonic_ns() -> u64 {
    let raw = SOURCE.load(Ordering::Acquire);
    if raw.is_null() {
        return 0;
    }
    // SAFETY: The pointer was produced from a `ClockSource` fn pointer in
    // `clock_register_source` and is never mutated to anything else.
    let source: ClockSource = unsafe { core::mem::transmute(raw) };
    source()
}

/// Returns system uptime in milliseconds.
///
/// Convenience wrapper around [`monotonic_ns`] with millisecond granularity.
#[inline]
pub fn uptime_ms() -> u64 {
    monotonic_ns() / 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_source() -> u64 {
        5_000_000_000
    }

    #[test]
    fn registered_source_drives_uptime() {
        clock_register_source(fixed_source);
        assert_eq!(monotonic_ns(), 5_000_000_000);
        assert_eq!(uptime_ms(), 5_000);
    }
}
