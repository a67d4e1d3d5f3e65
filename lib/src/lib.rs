#![no_std]

#[cfg(test)]
extern crate std;

pub mod clock;
pub mod klog;

pub use klog::{KlogBackend, KlogLevel, klog_register_backend, klog_set_level};
