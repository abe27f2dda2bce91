use std::ops::Deref;

/// Pads `T` out to a full cache line so producer-owned and consumer-owned
/// atomics never share a cache line.
#[repr(align(64))]
pub struct CachePadded<T>(T);

impl<T> CachePadded<T> {
    pub const fn new(value: T) -> Self {
        CachePadded(value)
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}
