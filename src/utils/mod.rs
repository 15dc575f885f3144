//! # Utility Functions
//!
//! Helpers shared by the buffer, device and DVR layers:
//!
//! - Modular offset arithmetic for ring buffers
//! - Buffer size validation against engine limits
//! - Notification-based waiting for async consumers and producers
//!
//! Event offsets are physical ring offsets, so everything here works modulo
//! the ring capacity:
//!
//! ```rust
//! use dmxcore::utils::{ring_distance, wrap_add};
//!
//! assert_eq!(wrap_add(90, 20, 100), 10);
//! assert_eq!(ring_distance(90, 10, 100), 20);
//! ```

/// Notification-based waiting
pub mod wait;

pub use wait::wait_until;

/// Adds `n` to `offset` on a ring of `capacity` bytes.
///
/// A zero capacity (a buffer that was never given storage) yields the plain sum.
pub fn wrap_add(offset: usize, n: usize, capacity: usize) -> usize {
    if capacity == 0 {
        offset + n
    } else {
        (offset + n) % capacity
    }
}

/// Forward distance from `from` to `to` on a ring of `capacity` bytes.
pub fn ring_distance(from: usize, to: usize, capacity: usize) -> usize {
    if to >= from {
        to - from
    } else if capacity == 0 {
        0
    } else {
        capacity - from + to
    }
}

/// Checks `size` against a maximum and an alignment (0 means unaligned).
pub fn size_fits(size: usize, max_size: usize, alignment: usize) -> bool {
    size <= max_size && (alignment == 0 || size % alignment == 0)
}

/// Rounds `size` down to a multiple of `unit`.
pub fn align_down(size: usize, unit: usize) -> usize {
    if unit == 0 {
        size
    } else {
        size / unit * unit
    }
}
