//! Serialized access to a family's registers.
//!
//! Every register sequence (a status query as much as a whole DMA start-wait-inspect cycle) runs
//! inside one of these scopes, so a monitoring thread can never interleave with a readout. The
//! guard is dropped on every way out of the body, including `?` returns and panics.
//!
//! A poisoned lock (a previous holder panicked) is logged and then used anyway. Readout keeps
//! going on whatever state the panicking holder left behind.

use crate::registry::{
    BoardRegistry,
    CrateState,
};
use std::sync::{
    MutexGuard,
    PoisonError,
    TryLockError,
};
use tracing::error;

impl<B, F> BoardRegistry<B, F> {
    fn recover(poisoned: PoisonError<MutexGuard<'_, CrateState<B>>>) -> MutexGuard<'_, CrateState<B>> {
        error!("A previous holder of the board lock panicked, continuing with its state");
        poisoned.into_inner()
    }

    /// Run `body` with the family lock held
    /// # Example
    /// ```
    /// # use codavme::{prelude::*, bus::mock::{Mock, Simulated}};
    /// # let mock = Mock::new();
    /// # let options = InitOptions::new(interpret_jvme);
    /// # mock.insert_board(F1Tdc::simulate(3, 0x0400, 3 << 19, options.a32_for(3)));
    /// # let registry: BoardRegistry<_, F1Tdc> =
    /// #     BoardRegistry::init(mock, &[3 << 19], options).unwrap();
    /// let mask = registry.with_board_lock(|state| state.scan_mask());
    /// assert_eq!(mask, 1 << 3);
    /// ```
    pub fn with_board_lock<R>(&self, body: impl FnOnce(&mut CrateState<B>) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(Self::recover);
        body(&mut guard)
    }

    /// Run `body` with the family lock held if nobody else holds it right now
    pub fn try_with_board_lock<R>(&self, body: impl FnOnce(&mut CrateState<B>) -> R) -> Option<R> {
        let mut guard = match self.state.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => Self::recover(poisoned),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(body(&mut guard))
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::f1_crate;
    use std::{
        panic::{
            catch_unwind,
            AssertUnwindSafe,
        },
        sync::mpsc,
        thread,
    };

    #[test]
    fn test_released_after_body() {
        let (_, registry) = f1_crate(&[3]);
        let res: Result<(), &str> = registry.with_board_lock(|_| Err("bail"));
        assert!(res.is_err());
        assert_eq!(registry.try_with_board_lock(|s| s.scan_mask()), Some(1 << 3));
    }

    #[test]
    fn test_held_while_running() {
        let (_, registry) = f1_crate(&[3]);
        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let other = registry.clone();
        let holder = thread::spawn(move || {
            other.with_board_lock(|_| {
                locked_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            });
        });
        locked_rx.recv().unwrap();
        assert!(registry.try_with_board_lock(|_| ()).is_none());
        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(registry.try_with_board_lock(|_| ()).is_some());
    }

    #[test]
    fn test_poisoned_lock_still_usable() {
        let (_, registry) = f1_crate(&[3, 4]);
        let res = catch_unwind(AssertUnwindSafe(|| {
            registry.with_board_lock(|_| panic!("holder died"));
        }));
        assert!(res.is_err());
        assert_eq!(registry.slots(), [3, 4]);
        assert!(registry.try_with_board_lock(|_| ()).is_some());
        assert!(registry.status(3).is_ok());
    }
}
