//! A readout thread that stands in for a trigger interrupt: it waits for a board (or a whole
//! chain) to have a block ready, reads it the same way any other caller would, and hands the
//! words to a callback.

use super::{
    classify::TransferOutcome,
    ReadMode,
};
use crate::{
    board::BoardFamily,
    bus::Bus,
    core::SlotId,
    registry::BoardRegistry,
};
use crossbeam_channel::{
    bounded,
    RecvTimeoutError,
    Sender,
};
use std::{
    thread::{
        self,
        JoinHandle,
    },
    time::Duration,
};
use tracing::{
    debug,
    error,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    /// The board to read (the first board of the chain for multiboard reads)
    pub slot: SlotId,
    pub mode: ReadMode,
    /// Largest block to expect
    pub max_words: usize,
    /// Time between readiness checks
    pub interval: Duration,
}

/// One block as delivered to the callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadoutBlock {
    pub slot: SlotId,
    pub outcome: TransferOutcome,
    /// The data words, without any alignment filler
    pub words: Vec<u32>,
}

/// Handle to a running readout thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct Poller {
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl Poller {
    /// Start reading blocks from `registry` as they become ready
    /// # Errors
    /// Returns an error if the thread couldn't be spawned
    pub fn spawn<B, F, C>(
        registry: BoardRegistry<B, F>,
        config: PollerConfig,
        mut callback: C,
    ) -> std::io::Result<Self>
    where
        B: Bus + Send + 'static,
        F: BoardFamily,
        C: FnMut(ReadoutBlock) + Send + 'static,
    {
        let (stop, stopped) = bounded(1);
        let thread = thread::Builder::new()
            .name(format!("{}-readout-{}", F::NAME, config.slot))
            .spawn(move || {
                debug!("{} readout thread for slot {} started", F::NAME, config.slot);
                let mut buf = vec![0u32; config.max_words + 1];
                loop {
                    match stopped.recv_timeout(config.interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let ready = match config.mode {
                        ReadMode::MultiboardDma => registry.chain_ready(),
                        _ => registry.data_ready(config.slot),
                    };
                    match ready {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(e) => {
                            error!("{} slot {}: readiness check failed - {e}", F::NAME, config.slot);
                            continue;
                        }
                    }
                    let result =
                        registry.read_block(config.slot, &mut buf, config.max_words, config.mode);
                    // A drain leaves the token on the last board, a failed one wherever it stopped
                    if config.mode == ReadMode::MultiboardDma {
                        if let Err(e) = registry.reset_chain_tokens() {
                            error!("{} token reset after readout failed - {e}", F::NAME);
                        }
                    }
                    let outcome = match result {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!("{} slot {}: readout failed - {e}", F::NAME, config.slot);
                            continue;
                        }
                    };
                    callback(ReadoutBlock {
                        slot: config.slot,
                        outcome,
                        words: outcome.data(&buf).to_vec(),
                    });
                }
                debug!("{} readout thread for slot {} stopped", F::NAME, config.slot);
            })?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Stop the thread and wait for it to finish its current block
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        // The thread may already be gone, in which case there's nobody to tell
        let _ = self.stop.try_send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("The readout thread panicked");
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        board::TokenPath,
        bus::mock::DmaFault,
        readout::classify::OutcomeKind,
        testing::{
            block,
            f1_crate,
        },
    };
    use crossbeam_channel::unbounded;

    const TICK: Duration = Duration::from_millis(1);
    const PATIENCE: Duration = Duration::from_secs(5);

    #[test]
    fn test_single_board_blocks() {
        let (mock, registry) = f1_crate(&[6]);
        let (tx, rx) = unbounded();
        let poller = Poller::spawn(
            registry,
            PollerConfig {
                slot: 6,
                mode: ReadMode::SingleBoardDma,
                max_words: 100,
                interval: TICK,
            },
            move |block| tx.send(block).unwrap(),
        )
        .unwrap();
        let first = block(6, 3);
        let second = block(6, 7);
        mock.push_block(6, &first);
        mock.push_block(6, &second);
        let got = rx.recv_timeout(PATIENCE).unwrap();
        assert_eq!(got.slot, 6);
        assert_eq!(got.outcome.kind, OutcomeKind::TerminatedByBusError);
        assert_eq!(got.words, first);
        assert_eq!(rx.recv_timeout(PATIENCE).unwrap().words, second);
        poller.stop();
    }

    #[test]
    fn test_chain_blocks_reset_token() {
        let (mock, registry) = f1_crate(&[2, 3]);
        let chain = registry.enable_multiblock(TokenPath::P0).unwrap();
        mock.set_chain(chain.window, &[2, 3]);
        let (tx, rx) = unbounded();
        let poller = Poller::spawn(
            registry.clone(),
            PollerConfig {
                slot: 2,
                mode: ReadMode::MultiboardDma,
                max_words: 100,
                interval: TICK,
            },
            move |block| tx.send(block).unwrap(),
        )
        .unwrap();
        // Only one board has data, the chain isn't ready yet
        mock.push_block(2, &block(2, 1));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        mock.push_block(3, &block(3, 1));
        let got = rx.recv_timeout(PATIENCE).unwrap();
        assert_eq!(got.words.len(), 6);
        drop(poller);
        assert_eq!(registry.token_holders().unwrap(), [2]);
    }

    #[test]
    fn test_chain_token_reset_after_failed_read() {
        let (mock, registry) = f1_crate(&[2, 3]);
        let chain = registry.enable_multiblock(TokenPath::P0).unwrap();
        mock.set_chain(chain.window, &[2, 3]);
        // The first drain moves its data but can't read the last board's status afterwards
        mock.inject(DmaFault::StatusLost);
        for n in 1..=2 {
            mock.push_block(2, &block(2, n));
            mock.push_block(3, &block(3, n));
        }
        let (tx, rx) = unbounded();
        let poller = Poller::spawn(
            registry.clone(),
            PollerConfig {
                slot: 2,
                mode: ReadMode::MultiboardDma,
                max_words: 100,
                interval: TICK,
            },
            move |block| tx.send(block).unwrap(),
        )
        .unwrap();
        // Only the second trigger is delivered, and all of it
        let got = rx.recv_timeout(PATIENCE).unwrap();
        assert_eq!(got.outcome.kind, OutcomeKind::TerminatedByBusError);
        assert_eq!(got.words, [block(2, 2), block(3, 2)].concat());
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        drop(poller);
        assert_eq!(mock.dma_log().len(), 2);
        assert_eq!(registry.token_holders().unwrap(), [2]);
    }
}
