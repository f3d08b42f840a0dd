//! The table of initialized boards of one family and the operations on it that don't move data

use crate::{
    board::{
        BoardFamily,
        BoardHandle,
        TokenPath,
    },
    bus::{
        self,
        Bus,
    },
    core::{
        slot_mask,
        valid_slot,
        SlotId,
        MAX_SLOT,
    },
    multiblock::MultiblockChain,
    readout::classify::WaitInterpreter,
};
use std::{
    marker::PhantomData,
    sync::{
        Arc,
        Mutex,
    },
    time::Duration,
};
use thiserror::Error;
use tracing::{
    debug,
    info,
    warn,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Bus(#[from] bus::Error),
    #[error("Slot {0} is not a slot of a VME crate")]
    InvalidSlot(SlotId),
    #[error("No {family} was initialized in slot {slot}")]
    BoardNotInitialized { family: &'static str, slot: SlotId },
    #[error("The destination buffer can't hold a single word")]
    InvalidDestination,
    #[error("Multiboard readout has to go through the first board of the chain, not slot {0}")]
    InvalidChainRole(SlotId),
    #[error("Multiblock readout is not enabled")]
    MultiblockDisabled,
    #[error("Slot {0} is in a multiblock chain, its role decides bus error termination")]
    ChainedBusError(SlotId),
    #[error("More than one board answered for slot {0}")]
    DuplicateSlot(SlotId),
    #[error("No {0} boards were found")]
    NoBoards(&'static str),
    #[error("{family} can't pass the token over {path:?}")]
    UnsupportedTokenPath {
        family: &'static str,
        path: TokenPath,
    },
    #[error("Block level {0} is out of range")]
    BlockLevel(u32),
    #[error("Bad value `{value}` for {key}")]
    Config { key: String, value: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Settings for bringing up a family of boards
#[derive(Debug, Copy, Clone)]
pub struct InitOptions {
    /// A32 address of the FIFO window of the board in slot 0
    pub a32_base: u32,
    /// Distance between the FIFO windows of neighboring slots
    pub a32_stride: u32,
    /// A32 address shared by all boards in multiblock mode
    pub multiblock_window: u32,
    /// How long to wait for a DMA transfer before giving up on it
    pub dma_timeout: Duration,
    /// Turns the bus driver's raw DMA wait result into something we can reason about
    pub interpret: WaitInterpreter,
    /// Terminate block transfers with a bus error outside of multiblock mode
    pub bus_error: bool,
    /// Events per block programmed at init
    pub block_level: u32,
    /// Keep boards whose firmware is older than the family minimum
    pub ignore_firmware: bool,
}

impl InitOptions {
    /// Default options with the DMA wait results read by `interpret`
    #[must_use]
    pub fn new(interpret: WaitInterpreter) -> Self {
        Self {
            a32_base: 0x0800_0000,
            a32_stride: 0x0008_0000,
            multiblock_window: 0x0A00_0000,
            dma_timeout: Duration::from_secs(10),
            interpret,
            bus_error: true,
            block_level: 1,
            ignore_firmware: false,
        }
    }

    #[must_use]
    pub fn a32(mut self, base: u32, stride: u32) -> Self {
        self.a32_base = base;
        self.a32_stride = stride;
        self
    }

    #[must_use]
    pub fn multiblock_window(mut self, window: u32) -> Self {
        self.multiblock_window = window;
        self
    }

    #[must_use]
    pub fn dma_timeout(mut self, timeout: Duration) -> Self {
        self.dma_timeout = timeout;
        self
    }

    #[must_use]
    pub fn bus_error(mut self, enable: bool) -> Self {
        self.bus_error = enable;
        self
    }

    #[must_use]
    pub fn block_level(mut self, level: u32) -> Self {
        self.block_level = level;
        self
    }

    #[must_use]
    pub fn ignore_firmware(mut self, ignore: bool) -> Self {
        self.ignore_firmware = ignore;
        self
    }

    /// The A32 FIFO address given to the board in `slot`
    #[must_use]
    pub fn a32_for(&self, slot: SlotId) -> u32 {
        self.a32_base + u32::from(slot) * self.a32_stride
    }
}

/// Everything guarded by a registry's lock
#[derive(Debug)]
pub struct CrateState<B> {
    pub(crate) bus: B,
    pub(crate) boards: [Option<BoardHandle>; MAX_SLOT as usize + 1],
    pub(crate) chain: Option<MultiblockChain>,
    pub(crate) options: InitOptions,
}

impl<B> CrateState<B> {
    /// The bus the boards sit on
    pub fn bus(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Every initialized board, lowest slot first
    pub fn handles(&self) -> impl Iterator<Item = &BoardHandle> {
        self.boards.iter().flatten()
    }

    /// The handle of the board in `slot`
    /// # Errors
    /// Returns an error if `slot` is not a valid slot or holds no initialized board
    pub fn handle(&self, family: &'static str, slot: SlotId) -> Result<BoardHandle> {
        if !valid_slot(slot) {
            return Err(Error::InvalidSlot(slot));
        }
        self.boards[usize::from(slot)].ok_or(Error::BoardNotInitialized { family, slot })
    }

    pub(crate) fn handle_mut(
        &mut self,
        family: &'static str,
        slot: SlotId,
    ) -> Result<&mut BoardHandle> {
        if !valid_slot(slot) {
            return Err(Error::InvalidSlot(slot));
        }
        self.boards[usize::from(slot)]
            .as_mut()
            .ok_or(Error::BoardNotInitialized { family, slot })
    }

    /// Bitmask of every initialized slot
    #[must_use]
    pub fn scan_mask(&self) -> u32 {
        self.handles().fold(0, |mask, h| mask | slot_mask(h.slot))
    }

    #[must_use]
    pub fn min_slot(&self) -> Option<SlotId> {
        self.handles().next().map(|h| h.slot)
    }

    #[must_use]
    pub fn max_slot(&self) -> Option<SlotId> {
        self.handles().last().map(|h| h.slot)
    }

    #[must_use]
    pub fn chain(&self) -> Option<MultiblockChain> {
        self.chain
    }

    #[must_use]
    pub fn options(&self) -> &InitOptions {
        &self.options
    }
}

/// The boards of one family in one crate, behind the lock that serializes every register access
/// to them.
///
/// Cloning is cheap and every clone shares the same boards and lock.
#[derive(Debug)]
pub struct BoardRegistry<B, F> {
    pub(crate) state: Arc<Mutex<CrateState<B>>>,
    family: PhantomData<fn() -> F>,
}

impl<B, F> Clone for BoardRegistry<B, F> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            family: PhantomData,
        }
    }
}

impl<B, F> BoardRegistry<B, F>
where
    B: Bus,
    F: BoardFamily,
{
    /// Probe and initialize the boards with registers at each of `bases`.
    ///
    /// Addresses where nothing answers, where something other than this family answers, or
    /// where the firmware is too old are skipped with a warning.
    /// # Errors
    /// Returns an error if no boards were found, two boards report the same slot, or on bus
    /// failures while initializing a board
    pub fn init(mut bus: B, bases: &[u32], options: InitOptions) -> Result<Self> {
        if options.block_level == 0 || options.block_level > F::MAX_BLOCK_LEVEL {
            return Err(Error::BlockLevel(options.block_level));
        }
        let mut boards = [None; MAX_SLOT as usize + 1];
        for &base in bases {
            let probe = match F::probe(&mut bus, base) {
                Ok(Some(probe)) => probe,
                Ok(None) => {
                    warn!("The board at {base:#08x} is not a {}, skipping", F::NAME);
                    continue;
                }
                Err(bus::Error::BusTimeout { .. }) => {
                    warn!("No board responded at {base:#08x}, skipping");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if !valid_slot(probe.slot) {
                warn!(
                    "The {} at {base:#08x} reports impossible slot {}, skipping",
                    F::NAME,
                    probe.slot
                );
                continue;
            }
            if probe.firmware < F::MIN_FIRMWARE {
                if options.ignore_firmware {
                    warn!(
                        "{} in slot {} runs old firmware {:#06x}, continuing anyway",
                        F::NAME,
                        probe.slot,
                        probe.firmware
                    );
                } else {
                    warn!(
                        "{} in slot {} runs firmware {:#06x}, at least {:#06x} is required, skipping",
                        F::NAME,
                        probe.slot,
                        probe.firmware,
                        F::MIN_FIRMWARE
                    );
                    continue;
                }
            }
            let entry = &mut boards[usize::from(probe.slot)];
            if entry.is_some() {
                return Err(Error::DuplicateSlot(probe.slot));
            }
            let handle = BoardHandle {
                slot: probe.slot,
                register_base: base,
                fifo: F::fifo(base, options.a32_for(probe.slot)),
                firmware: probe.firmware,
                role: None,
                bus_error_enabled: options.bus_error,
                block_level: options.block_level,
                blocks_read: 0,
                words_read: 0,
            };
            F::initialize(&mut bus, &handle)?;
            debug!(
                "Initialized {} in slot {} at {base:#08x}, FIFO at {:?} {:#010x}",
                F::NAME,
                handle.slot,
                handle.fifo.0,
                handle.fifo.1
            );
            *entry = Some(handle);
        }
        let state = CrateState {
            bus,
            boards,
            chain: None,
            options,
        };
        if state.min_slot().is_none() {
            return Err(Error::NoBoards(F::NAME));
        }
        info!(
            "Found {} {} boards, slot mask {:#010x}",
            state.handles().count(),
            F::NAME,
            state.scan_mask()
        );
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            family: PhantomData,
        })
    }

    /// Probe and initialize `count` boards with registers starting at `first` and spaced by
    /// `increment`
    /// # Errors
    /// Same as [`BoardRegistry::init`]
    pub fn init_range(
        bus: B,
        first: u32,
        increment: u32,
        count: usize,
        options: InitOptions,
    ) -> Result<Self> {
        let bases: Vec<_> = std::iter::successors(Some(first), |b| b.checked_add(increment))
            .take(count)
            .collect();
        Self::init(bus, &bases, options)
    }

    /// A copy of the handle of the board in `slot`
    /// # Errors
    /// Returns an error if there is no initialized board in `slot`
    pub fn handle(&self, slot: SlotId) -> Result<BoardHandle> {
        self.with_board_lock(|state| state.handle(F::NAME, slot))
    }

    /// Every initialized slot, lowest first
    #[must_use]
    pub fn slots(&self) -> Vec<SlotId> {
        self.with_board_lock(|state| state.handles().map(|h| h.slot).collect())
    }

    #[must_use]
    pub fn scan_mask(&self) -> u32 {
        self.with_board_lock(|state| state.scan_mask())
    }

    #[must_use]
    pub fn min_slot(&self) -> Option<SlotId> {
        self.with_board_lock(|state| state.min_slot())
    }

    #[must_use]
    pub fn max_slot(&self) -> Option<SlotId> {
        self.with_board_lock(|state| state.max_slot())
    }

    /// Read the status registers of the board in `slot`
    /// # Errors
    /// Returns an error on bad slots or bus failures
    pub fn status(&self, slot: SlotId) -> Result<F::Status> {
        self.with_board_lock(|state| {
            let handle = state.handle(F::NAME, slot)?;
            Ok(F::status(&mut state.bus, &handle)?)
        })
    }

    /// Read the status registers of every board, lowest slot first
    /// # Errors
    /// Returns an error on bus failures
    pub fn gstatus(&self) -> Result<Vec<(SlotId, F::Status)>> {
        self.with_board_lock(|state| {
            let handles: Vec<_> = state.handles().copied().collect();
            handles
                .iter()
                .map(|h| -> Result<_> { Ok((h.slot, F::status(&mut state.bus, h)?)) })
                .collect()
        })
    }

    /// Empty the FIFO of the board in `slot`
    /// # Errors
    /// Returns an error on bad slots or bus failures
    pub fn clear(&self, slot: SlotId) -> Result<()> {
        self.with_board_lock(|state| {
            let handle = state.handle(F::NAME, slot)?;
            F::clear(&mut state.bus, &handle)?;
            debug!("Cleared {} in slot {slot}", F::NAME);
            Ok(())
        })
    }

    /// Set the number of events per block of the board in `slot`
    /// # Errors
    /// Returns an error on bad slots, out of range levels, or bus failures
    pub fn set_block_level(&self, slot: SlotId, level: u32) -> Result<()> {
        if level == 0 || level > F::MAX_BLOCK_LEVEL {
            return Err(Error::BlockLevel(level));
        }
        self.with_board_lock(|state| {
            let handle = state.handle(F::NAME, slot)?;
            F::set_block_level(&mut state.bus, &handle, level)?;
            state.handle_mut(F::NAME, slot)?.block_level = level;
            Ok(())
        })
    }

    /// Choose whether the board in `slot` ends block transfers with a bus error
    /// # Errors
    /// Returns `ChainedBusError` while multiblock readout is enabled, or an error on bad slots
    /// or bus failures
    pub fn set_bus_error(&self, slot: SlotId, enable: bool) -> Result<()> {
        self.with_board_lock(|state| {
            let handle = state.handle(F::NAME, slot)?;
            if state.chain.is_some() {
                return Err(Error::ChainedBusError(slot));
            }
            F::set_bus_error(&mut state.bus, &handle, enable)?;
            state.handle_mut(F::NAME, slot)?.bus_error_enabled = enable;
            Ok(())
        })
    }

    /// Is a block waiting in the board in `slot`
    /// # Errors
    /// Returns an error on bad slots or bus failures
    pub fn data_ready(&self, slot: SlotId) -> Result<bool> {
        self.with_board_lock(|state| {
            let handle = state.handle(F::NAME, slot)?;
            Ok(F::block_ready(&mut state.bus, &handle)?)
        })
    }

    /// Mask of the slots with a block waiting
    /// # Errors
    /// Returns an error on bus failures
    pub fn ready_mask(&self) -> Result<u32> {
        self.with_board_lock(|state| {
            let handles: Vec<_> = state.handles().copied().collect();
            let mut mask = 0;
            for handle in &handles {
                if F::block_ready(&mut state.bus, handle)? {
                    mask |= slot_mask(handle.slot);
                }
            }
            Ok(mask)
        })
    }

    /// Does every board in the multiblock chain have a block waiting
    /// # Errors
    /// Returns `MultiblockDisabled` outside of multiblock mode, or an error on bus failures
    pub fn chain_ready(&self) -> Result<bool> {
        let chain = self.chain().ok_or(Error::MultiblockDisabled)?;
        Ok(self.ready_mask()? & chain.members == chain.members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        boards::f1tdc::F1Tdc,
        bus::mock::{
            Mock,
            Simulated,
        },
        testing::{
            base,
            f1_crate,
            options,
        },
    };

    #[test]
    fn test_init() {
        let (_, registry) = f1_crate(&[3, 7, 12]);
        assert_eq!(registry.slots(), [3, 7, 12]);
        assert_eq!(registry.scan_mask(), (1 << 3) | (1 << 7) | (1 << 12));
        assert_eq!(registry.min_slot(), Some(3));
        assert_eq!(registry.max_slot(), Some(12));
        let handle = registry.handle(7).unwrap();
        assert_eq!(handle.register_base, base(7));
        assert_eq!(handle.fifo.1, options().a32_for(7));
        assert!(handle.bus_error_enabled);
        assert!(handle.role.is_none());
    }

    #[test]
    fn test_init_skips_missing_and_old() {
        let mock = Mock::new();
        let opts = options();
        mock.insert_board(F1Tdc::simulate(4, 0x0400, base(4), opts.a32_for(4)));
        mock.insert_board(F1Tdc::simulate(6, 0x0001, base(6), opts.a32_for(6)));
        let registry: BoardRegistry<_, F1Tdc> =
            BoardRegistry::init_range(mock.clone(), base(4), 1 << 19, 3, opts).unwrap();
        // Slot 5 is empty and slot 6 runs ancient firmware
        assert_eq!(registry.slots(), [4]);

        let registry: BoardRegistry<_, F1Tdc> =
            BoardRegistry::init_range(mock, base(4), 1 << 19, 3, opts.ignore_firmware(true))
                .unwrap();
        assert_eq!(registry.slots(), [4, 6]);
    }

    #[test]
    fn test_init_errors() {
        let mock = Mock::new();
        let res: Result<BoardRegistry<_, F1Tdc>> =
            BoardRegistry::init(mock.clone(), &[base(3)], options());
        assert!(matches!(res, Err(Error::NoBoards("F1TDC"))));

        let opts = options();
        mock.insert_board(F1Tdc::simulate(3, 0x0400, base(3), opts.a32_for(3)));
        let res: Result<BoardRegistry<_, F1Tdc>> =
            BoardRegistry::init(mock.clone(), &[base(3), base(3)], opts);
        assert!(matches!(res, Err(Error::DuplicateSlot(3))));

        let res: Result<BoardRegistry<_, F1Tdc>> =
            BoardRegistry::init(mock, &[base(3)], opts.block_level(0));
        assert!(matches!(res, Err(Error::BlockLevel(0))));
    }

    #[test]
    fn test_bad_slots() {
        let (_, registry) = f1_crate(&[3]);
        assert!(matches!(registry.status(0), Err(Error::InvalidSlot(0))));
        assert!(matches!(registry.status(22), Err(Error::InvalidSlot(22))));
        assert!(matches!(
            registry.status(4),
            Err(Error::BoardNotInitialized { slot: 4, .. })
        ));
    }

    #[test]
    fn test_block_level_and_bus_error() {
        let (mock, registry) = f1_crate(&[3]);
        registry.set_block_level(3, 16).unwrap();
        assert_eq!(registry.handle(3).unwrap().block_level, 16);
        assert_eq!(
            mock.peek(bus::AddressSpace::A24, base(3) + 0x10, 4),
            Some(16)
        );
        assert!(matches!(
            registry.set_block_level(3, 0),
            Err(Error::BlockLevel(0))
        ));
        registry.set_bus_error(3, false).unwrap();
        assert!(!registry.handle(3).unwrap().bus_error_enabled);
        assert!(!registry.status(3).unwrap().bus_error_enabled);
    }

    #[test]
    fn test_bus_error_locked_by_chain() {
        let (_, registry) = f1_crate(&[5, 9, 13]);
        registry.enable_multiblock(TokenPath::P0).unwrap();
        assert!(matches!(
            registry.set_bus_error(9, true),
            Err(Error::ChainedBusError(9))
        ));
        assert!(matches!(
            registry.set_bus_error(13, false),
            Err(Error::ChainedBusError(13))
        ));
        assert!(!registry.handle(9).unwrap().bus_error_enabled);
        assert!(!registry.status(9).unwrap().bus_error_enabled);
        assert!(registry.handle(13).unwrap().bus_error_enabled);

        registry.disable_multiblock().unwrap();
        registry.set_bus_error(9, false).unwrap();
        assert!(!registry.handle(9).unwrap().bus_error_enabled);
    }

    #[test]
    fn test_ready_and_clear() {
        let (mock, registry) = f1_crate(&[3, 8]);
        assert_eq!(registry.ready_mask().unwrap(), 0);
        mock.push_block(8, &[0x8800_0001]);
        assert!(registry.data_ready(8).unwrap());
        assert!(!registry.data_ready(3).unwrap());
        assert_eq!(registry.ready_mask().unwrap(), 1 << 8);
        registry.clear(8).unwrap();
        assert_eq!(mock.pending_blocks(8), 0);
        assert_eq!(registry.ready_mask().unwrap(), 0);
        assert!(matches!(
            registry.chain_ready(),
            Err(Error::MultiblockDisabled)
        ));
    }

    #[test]
    fn test_gstatus() {
        let (_, registry) = f1_crate(&[3, 8]);
        let statuses = registry.gstatus().unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].0, 3);
        assert_eq!(statuses[1].1.slot, 8);
        assert!(statuses[1].1.to_string().contains("slot 8"));
    }
}
