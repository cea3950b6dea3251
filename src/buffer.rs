//! Process-wide pool of reusable byte buffers.
//!
//! Subprocess stdout/stderr capture and git command capture churn through
//! multi-megabyte buffers; recycling them keeps allocation out of the hot
//! path when many checks run at once. The pool is a plain free list: `get`
//! hands out a buffer, `put` returns it. Returning the same buffer twice is
//! a bug in the caller and panics.

use std::sync::{Mutex, OnceLock};

/// Buffers returned to the pool above this capacity are dropped instead of
/// retained, so one huge capture doesn't pin memory for the process lifetime.
const MAX_RETAINED_CAPACITY: usize = 4 << 20;

static POOL: OnceLock<Pool> = OnceLock::new();

/// The process-wide pool.
pub fn pool() -> &'static Pool {
    POOL.get_or_init(Pool::new)
}

/// A pooled byte buffer. Treat it as a `Vec<u8>`; hand it back with
/// [`Pool::put`] when done.
#[derive(Debug)]
pub struct PooledBuf {
    data: Vec<u8>,
    token: u64,
}

impl std::ops::Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.data
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

#[derive(Debug, Default)]
struct State {
    free: Vec<Vec<u8>>,
    /// Tokens of buffers currently out of the pool. Guards against
    /// double-return.
    outstanding: Vec<u64>,
    next_token: u64,
}

/// Mutex-guarded free list of byte buffers.
#[derive(Debug)]
pub struct Pool {
    state: Mutex<State>,
}

impl Pool {
    fn new() -> Self {
        Pool {
            state: Mutex::new(State::default()),
        }
    }

    /// Take a buffer out of the pool, allocating a fresh one if the free
    /// list is empty. The buffer is empty but may have leftover capacity.
    pub fn get(&self) -> PooledBuf {
        let mut state = self.state.lock().unwrap();
        let mut data = state.free.pop().unwrap_or_default();
        data.clear();
        let token = state.next_token;
        state.next_token += 1;
        state.outstanding.push(token);
        PooledBuf { data, token }
    }

    /// Return a buffer to the pool.
    ///
    /// # Panics
    ///
    /// Panics if the buffer was already returned.
    pub fn put(&self, buf: PooledBuf) {
        let mut state = self.state.lock().unwrap();
        match state.outstanding.iter().position(|t| *t == buf.token) {
            Some(i) => {
                state.outstanding.swap_remove(i);
            }
            None => panic!("buffer returned to the pool twice"),
        }
        if buf.data.capacity() <= MAX_RETAINED_CAPACITY {
            state.free.push(buf.data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_recycled() {
        let pool = Pool::new();
        let mut buf = pool.get();
        buf.extend_from_slice(b"hello");
        let cap = buf.capacity();
        pool.put(buf);

        let buf = pool.get();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), cap);
        pool.put(buf);
    }

    #[test]
    #[should_panic(expected = "returned to the pool twice")]
    fn double_return_panics() {
        let pool = Pool::new();
        let a = pool.get();
        let token = a.token;
        pool.put(a);
        // Forge a second return of the same token.
        pool.put(PooledBuf {
            data: Vec::new(),
            token,
        });
    }

    #[test]
    fn oversized_buffers_are_dropped() {
        let pool = Pool::new();
        let mut buf = pool.get();
        buf.reserve(MAX_RETAINED_CAPACITY + 1);
        pool.put(buf);
        assert!(pool.state.lock().unwrap().free.is_empty());
    }
}
