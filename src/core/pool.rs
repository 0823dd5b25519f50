//! # Object Pool
//!
//! Bounded pool for frequently reused objects on the encode/send hot path,
//! reducing allocator pressure under load.
//!
//! Pooling is an explicit capability: a type opts in by implementing
//! [`Poolable`], and the pool invokes `reset` on every return so a pooled
//! object can never leak state between uses. Guards return their object on
//! drop.
//!
//! ## Usage
//! ```rust,no_run
//! use realm_protocol::core::pool::{FrameBuffer, ObjectPool};
//!
//! let pool: ObjectPool<FrameBuffer> = ObjectPool::new(64);
//! pool.prealloc(16);
//! let mut buf = pool.get();
//! buf.as_mut_vec().extend_from_slice(b"frame bytes");
//! // Returned and reset on drop.
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use zeroize::Zeroize;

/// Capability required of pooled objects. `reset` must clear all payload
/// state; the pool calls it on every return.
pub trait Poolable: Send + 'static {
    fn reset(&mut self);
}

struct PoolInner<T> {
    items: Mutex<Vec<T>>,
    max_capacity: Mutex<usize>,
}

/// Thread-safe bounded pool. When the pool is empty, `get` falls back to
/// `T::default()`; when it is full, returned objects are dropped.
pub struct ObjectPool<T: Poolable + Default> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Poolable + Default> ObjectPool<T> {
    pub fn new(max_capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                items: Mutex::new(Vec::new()),
                max_capacity: Mutex::new(max_capacity),
            }),
        }
    }

    /// Acquire an object, reusing a pooled one when available.
    pub fn get(&self) -> Pooled<T> {
        let value = self
            .inner
            .items
            .lock()
            .ok()
            .and_then(|mut items| items.pop())
            .unwrap_or_default();
        Pooled {
            value: Some(value),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Fill the pool with `count` fresh objects, up to the capacity bound.
    pub fn prealloc(&self, count: usize) {
        let cap = *self.inner.max_capacity.lock().unwrap_or_else(|e| e.into_inner());
        if let Ok(mut items) = self.inner.items.lock() {
            while items.len() < cap.min(count) {
                items.push(T::default());
            }
        }
    }

    /// Adjust the capacity bound, shedding surplus objects immediately.
    pub fn set_max_capacity(&self, max_capacity: usize) {
        if let Ok(mut cap) = self.inner.max_capacity.lock() {
            *cap = max_capacity;
        }
        if let Ok(mut items) = self.inner.items.lock() {
            items.truncate(max_capacity);
        }
    }

    /// Number of objects currently resident in the pool.
    pub fn available(&self) -> usize {
        self.inner.items.lock().map(|items| items.len()).unwrap_or(0)
    }
}

impl<T: Poolable + Default> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Guard handing out a pooled object; returns it (reset) on drop.
pub struct Pooled<T: Poolable> {
    value: Option<T>,
    inner: Arc<PoolInner<T>>,
}

impl<T: Poolable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("pooled value present until drop")
    }
}

impl<T: Poolable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pooled value present until drop")
    }
}

impl<T: Poolable> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(mut value) = self.value.take() {
            value.reset();
            let cap = *self
                .inner
                .max_capacity
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Ok(mut items) = self.inner.items.lock() {
                if items.len() < cap {
                    items.push(value);
                }
            }
        }
    }
}

/// Reusable scratch buffer for frame serialization. Reset zeroes the bytes
/// before clearing so pooled memory never carries payload remnants.
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self {
            buf: Vec::with_capacity(crate::core::frame::HEADER_LEN + 256),
        }
    }
}

impl Poolable for FrameBuffer {
    fn reset(&mut self) {
        self.buf.zeroize();
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_returned_objects() {
        let pool: ObjectPool<FrameBuffer> = ObjectPool::new(4);
        assert_eq!(pool.available(), 0);
        {
            let mut buf = pool.get();
            buf.as_mut_vec().extend_from_slice(b"abc");
        }
        assert_eq!(pool.available(), 1);
        let buf = pool.get();
        assert!(buf.as_slice().is_empty());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn reset_clears_payload() {
        let pool: ObjectPool<FrameBuffer> = ObjectPool::new(1);
        {
            let mut buf = pool.get();
            buf.as_mut_vec().extend_from_slice(b"secret");
        }
        let buf = pool.get();
        assert_eq!(buf.as_slice().len(), 0);
    }

    #[test]
    fn capacity_bound_sheds_surplus() {
        let pool: ObjectPool<FrameBuffer> = ObjectPool::new(1);
        let a = pool.get();
        let b = pool.get();
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn prealloc_respects_capacity() {
        let pool: ObjectPool<FrameBuffer> = ObjectPool::new(3);
        pool.prealloc(10);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn shrinking_capacity_truncates() {
        let pool: ObjectPool<FrameBuffer> = ObjectPool::new(4);
        pool.prealloc(4);
        pool.set_max_capacity(2);
        assert_eq!(pool.available(), 2);
    }
}
