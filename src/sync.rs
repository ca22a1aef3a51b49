//! Wait primitives bridging GPU-asynchronous work and the synchronous
//! delivery thread.
//!
//! All GPU waits in the engine go through [`WaitScope`] so a different
//! waiting strategy (bounded timeouts, cooperative suspension) can be swapped
//! in at one place instead of at every call site.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Condvar, Mutex};

/// Blocking waits against a device's submission timeline.
///
/// Waits are unbounded: a stalled presentation stack will hang the delivery
/// thread rather than produce a partially-released frame.
pub struct WaitScope<'a> {
    device: &'a wgpu::Device,
}

impl<'a> WaitScope<'a> {
    pub fn new(device: &'a wgpu::Device) -> Self {
        Self { device }
    }

    /// Block until the given submission has completed on the GPU.
    pub fn submission(&self, index: wgpu::SubmissionIndex) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: Some(index),
                timeout: None,
            })
            .map_err(|e| anyhow!("wait for submission failed: {e:?}"))?;
        Ok(())
    }

    /// Block until every outstanding submission has completed.
    pub fn queue_idle(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| anyhow!("wait for queue idle failed: {e:?}"))?;
        Ok(())
    }
}

/// A producer-side fence attached to a delivered frame.
///
/// The producer signals it once it has finished writing the buffer; the
/// importer waits on it before reading. Cloning shares the same fence.
#[derive(Debug, Clone)]
pub struct FrameFence {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl FrameFence {
    /// Create an unsignaled fence.
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Create a fence that is already signaled.
    pub fn signaled() -> Self {
        let fence = Self::new();
        fence.signal();
        fence
    }

    /// Mark the buffer as fully written.
    pub fn signal(&self) {
        let (lock, cvar) = &*self.inner;
        let mut done = lock.lock().unwrap();
        *done = true;
        cvar.notify_all();
    }

    /// Block until the producer has signaled.
    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let mut done = lock.lock().unwrap();
        while !*done {
            done = cvar.wait(done).unwrap();
        }
    }

    pub fn is_signaled(&self) -> bool {
        *self.inner.0.lock().unwrap()
    }
}

impl Default for FrameFence {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn signaled_fence_does_not_block() {
        let fence = FrameFence::signaled();
        assert!(fence.is_signaled());
        fence.wait();
    }

    #[test]
    fn wait_blocks_until_producer_signals() {
        let fence = FrameFence::new();
        assert!(!fence.is_signaled());

        let producer = fence.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.signal();
        });

        fence.wait();
        assert!(fence.is_signaled());
        handle.join().unwrap();
    }
}
