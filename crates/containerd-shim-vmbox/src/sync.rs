//! One-shot synchronization cell.

use tokio::sync::watch::{channel, Receiver, Sender};

/// A cell that is written at most once and can be awaited by any number of
/// readers. Reads are idempotent: every waiter observes the same value, and
/// waiters arriving after the write return immediately.
///
/// Used for the per-process exit-status slot and the I/O-closed signal.
pub struct WaitableCell<T> {
    tx: Sender<Option<T>>,
    rx: Receiver<Option<T>>,
}

impl<T> Default for WaitableCell<T> {
    fn default() -> Self {
        let (tx, rx) = channel(None);
        Self { tx, rx }
    }
}

impl<T> Clone for WaitableCell<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T: Clone> WaitableCell<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cell's value. Returns the value back if the cell was already
    /// set; the stored value never changes after the first write.
    pub fn set(&self, val: impl Into<T>) -> Result<(), T> {
        let mut val: Option<T> = Some(val.into());
        self.tx.send_if_modified(|store| {
            if store.is_some() {
                return false;
            }
            std::mem::swap(store, &mut val);
            true
        });
        match val {
            None => Ok(()),
            Some(val) => Err(val),
        }
    }

    /// If the cell is still empty when the returned guard drops, set it to
    /// the result of `f`. A no-op when the cell was written in between.
    pub fn set_guard_with<R: Into<T>>(&self, f: impl FnOnce() -> R) -> impl Drop {
        struct SetGuard<T: Clone, R: Into<T>, F: FnOnce() -> R> {
            f: Option<F>,
            cell: WaitableCell<T>,
        }
        impl<T: Clone, R: Into<T>, F: FnOnce() -> R> Drop for SetGuard<T, R, F> {
            fn drop(&mut self) {
                let f = self.f.take().unwrap();
                let _ = self.cell.set(f());
            }
        }
        SetGuard {
            f: Some(f),
            cell: self.clone(),
        }
    }

    /// Wait for the cell to hold a value and return a copy of it.
    pub async fn wait(&self) -> T {
        let mut rx = self.rx.clone();
        let value = rx.wait_for(|store| store.is_some()).await;
        // the sender half lives in self, so the channel cannot be closed
        value.unwrap().clone().unwrap()
    }

    /// Non-blocking read.
    pub fn get(&self) -> Option<T> {
        self.rx.borrow().clone()
    }
}
