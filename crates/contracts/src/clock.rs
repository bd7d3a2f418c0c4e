//! MonotonicClock trait - device-local time source
//!
//! Nanoseconds since an arbitrary per-device origin, never adjusted by wall-clock changes.

/// Monotonic time source owned by one device.
pub trait MonotonicClock: Send + Sync {
    /// Current monotonic time (ns)
    fn now_nanos(&self) -> i64;
}

impl<T: MonotonicClock + ?Sized> MonotonicClock for std::sync::Arc<T> {
    fn now_nanos(&self) -> i64 {
        (**self).now_nanos()
    }
}
