//! The block readout engine: draining one block of events from a board FIFO into memory

pub mod classify;
pub mod poller;

use crate::{
    board::{
        BoardFamily,
        BoardHandle,
    },
    bus::{
        self,
        Bus,
        DmaRequest,
    },
    core::SlotId,
    multiblock::MultiblockChain,
    registry::{
        BoardRegistry,
        CrateState,
        Error,
        Result,
    },
};
use classify::{
    classify,
    OutcomeKind,
    TransferOutcome,
    WaitReading,
};
use tracing::{
    error,
    trace,
    warn,
};

/// How the words get from the board to memory
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ReadMode {
    /// One single cycle per word
    ProgrammedIo,
    /// A block transfer out of the board's own FIFO window
    SingleBoardDma,
    /// A block transfer out of the multiblock window, draining every board of the chain
    MultiboardDma,
}

impl<B, F> BoardRegistry<B, F>
where
    B: Bus,
    F: BoardFamily,
{
    /// Read one block from the board in `slot` into `dest`, moving at most `max_words` words.
    ///
    /// For DMA reads, a `dest` that doesn't start on an 8 byte boundary gets the family filler
    /// word at `dest[0]` and the data from `dest[1]` on, so `dest` needs room for `max_words + 1`
    /// words. How the transfer ended is part of the returned outcome, not an error.
    /// # Example
    /// ```
    /// # use codavme::{prelude::*, bus::mock::{Mock, Simulated}};
    /// # let mock = Mock::new();
    /// # let options = InitOptions::new(interpret_jvme);
    /// # mock.insert_board(F1Tdc::simulate(3, 0x0400, 3 << 19, options.a32_for(3)));
    /// # let registry: BoardRegistry<_, F1Tdc> =
    /// #     BoardRegistry::init(mock.clone(), &[3 << 19], options).unwrap();
    /// mock.push_block(3, &[0x8000_0001, 0x1234, 0x8800_0003]);
    /// let mut buf = vec![0u32; 101];
    /// let outcome = registry
    ///     .read_block(3, &mut buf, 100, ReadMode::SingleBoardDma)
    ///     .unwrap();
    /// assert_eq!(outcome.kind, OutcomeKind::TerminatedByBusError);
    /// assert_eq!(outcome.data(&buf), [0x8000_0001, 0x1234, 0x8800_0003]);
    /// ```
    /// # Errors
    /// Returns an error on an unusable buffer, a bad slot, a multiboard read through a board
    /// other than the first of the chain, or bus failures outside of the block transfer itself
    pub fn read_block(
        &self,
        slot: SlotId,
        dest: &mut [u32],
        max_words: usize,
        mode: ReadMode,
    ) -> Result<TransferOutcome> {
        if dest.is_empty() || max_words == 0 {
            return Err(Error::InvalidDestination);
        }
        self.with_board_lock(|state| {
            let handle = state.handle(F::NAME, slot)?;
            match mode {
                ReadMode::ProgrammedIo => read_programmed::<B, F>(state, &handle, dest, max_words),
                ReadMode::SingleBoardDma => {
                    read_dma::<B, F>(state, &handle, None, dest, max_words)
                }
                ReadMode::MultiboardDma => {
                    let chain = state.chain.ok_or(Error::MultiblockDisabled)?;
                    if !handle.is_first_in_chain() {
                        return Err(Error::InvalidChainRole(slot));
                    }
                    read_dma::<B, F>(state, &handle, Some(chain), dest, max_words)
                }
            }
        })
    }
}

/// The number of words to actually ask for, given the buffer that has to hold them after
/// `offset` leading words
fn capacity(family: &str, len: usize, offset: usize, max_words: usize) -> Result<usize> {
    if len <= offset {
        return Err(Error::InvalidDestination);
    }
    let room = len - offset;
    debug_assert!(
        max_words <= room,
        "{max_words} words requested into a buffer with room for {room}"
    );
    if max_words > room {
        warn!("{family}: {max_words} words requested but the buffer only holds {room}, clamping");
        return Ok(room);
    }
    Ok(max_words)
}

fn read_programmed<B: Bus, F: BoardFamily>(
    state: &mut CrateState<B>,
    handle: &BoardHandle,
    dest: &mut [u32],
    max_words: usize,
) -> Result<TransferOutcome> {
    let words = capacity(F::NAME, dest.len(), 0, max_words)?;
    let (space, addr) = handle.fifo;
    let mut count = 0;
    let mut kind = OutcomeKind::TerminatedByWordCount;
    while count < words {
        // Single cycle reads come back swapped to host order
        let word: u32 = state.bus.read(space, addr)?;
        dest[count] = word;
        count += 1;
        if F::is_block_trailer(word) {
            kind = OutcomeKind::Complete;
            break;
        }
    }
    if kind == OutcomeKind::TerminatedByWordCount {
        warn!(
            "{} slot {}: no block trailer within {words} words",
            F::NAME,
            handle.slot
        );
    }
    book::<B, F>(state, handle.slot, count, kind)?;
    Ok(TransferOutcome {
        words_transferred: count,
        kind,
        leading_filler: false,
    })
}

fn read_dma<B: Bus, F: BoardFamily>(
    state: &mut CrateState<B>,
    handle: &BoardHandle,
    chain: Option<MultiblockChain>,
    dest: &mut [u32],
    max_words: usize,
) -> Result<TransferOutcome> {
    let slot = handle.slot;
    // The DMA engines want 64 bit aligned destinations
    let leading_filler = dest.as_ptr() as usize % 8 != 0;
    let offset = usize::from(leading_filler);
    let words = capacity(F::NAME, dest.len(), offset, max_words)?;
    if leading_filler {
        dest[0] = F::FILLER_WORD;
    }
    let target = &mut dest[offset..offset + words];

    // The board that ends the transaction
    let terminator = match chain {
        Some(chain) => state.handle(F::NAME, chain.last)?,
        None => *handle,
    };
    let (space, source) = match chain {
        Some(chain) => (bus::AddressSpace::A32, chain.window),
        None => handle.fifo,
    };
    let request = DmaRequest {
        space,
        source,
        local_addr: target.as_ptr() as usize,
        nbytes: words * 4,
    };
    trace!("{} slot {slot}: starting DMA {request:?}", F::NAME);

    let failed = |kind| TransferOutcome {
        words_transferred: 0,
        kind,
        leading_filler,
    };
    if let Err(e) = state.bus.start_dma(&request) {
        error!("{} slot {slot}: DMA failed to start - {e}", F::NAME);
        return Ok(failed(OutcomeKind::DmaEngineError));
    }
    let reading = match state.bus.wait_dma(target, state.options.dma_timeout) {
        Ok(wait) => (state.options.interpret)(&wait, request.nbytes),
        Err(bus::Error::DmaTimeout(timeout)) => {
            error!("{} slot {slot}: DMA still running after {timeout:?}", F::NAME);
            WaitReading::TimedOut
        }
        Err(e) => {
            error!("{} slot {slot}: DMA failed - {e}", F::NAME);
            WaitReading::EngineError
        }
    };
    let berr = match reading {
        WaitReading::Transferred(_) => F::bus_error_status(&mut state.bus, &terminator)?,
        _ => false,
    };
    let kind = classify(reading, berr);
    let moved = match reading {
        WaitReading::Transferred(bytes) => (bytes / 4).min(words),
        _ => 0,
    };
    for word in &mut target[..moved] {
        *word = u32::from_be(*word);
    }

    match kind {
        OutcomeKind::TerminatedByBusError => {
            F::acknowledge_bus_error(&mut state.bus, &terminator)?;
            let last = target[..moved].iter().rev().find(|w| !F::is_filler(**w));
            if !last.is_some_and(|w| F::is_block_trailer(*w)) {
                error!(
                    "{} slot {slot}: block of {moved} words doesn't end with a trailer (last word {last:#010x?})",
                    F::NAME
                );
            }
        }
        OutcomeKind::TerminatedByWordCount => warn!(
            "{} slot {slot}: DMA terminated by word count ({moved} words), flush the board before the next read",
            F::NAME
        ),
        OutcomeKind::ZeroWordCount => {
            warn!("{} slot {slot}: DMA reported a word count of zero", F::NAME);
        }
        _ => {}
    }
    if !matches!(
        kind,
        OutcomeKind::TerminatedByBusError | OutcomeKind::TerminatedByWordCount
    ) {
        return Ok(failed(kind));
    }
    // The whole chain is booked on the board the read went through
    book::<B, F>(state, slot, moved, kind)?;
    Ok(TransferOutcome {
        words_transferred: moved + offset,
        kind,
        leading_filler,
    })
}

fn book<B, F: BoardFamily>(
    state: &mut CrateState<B>,
    slot: SlotId,
    words: usize,
    kind: OutcomeKind,
) -> Result<()> {
    let handle = state.handle_mut(F::NAME, slot)?;
    handle.words_read += words as u64;
    if kind.is_valid_block() {
        handle.blocks_read += 1;
    }
    Ok(())
}
