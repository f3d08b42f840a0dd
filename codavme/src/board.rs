//! Board handles and the trait every supported board family implements

use crate::{
    bus::{
        AddressSpace,
        Bus,
        BusResult,
    },
    core::SlotId,
};
use std::fmt::{
    Debug,
    Display,
};

/// The part a board plays in a multiblock token chain
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ChainRole {
    First,
    Middle,
    Last,
    /// The only board of the chain, both first and last
    Sole,
}

impl ChainRole {
    /// The role of `slot` in a chain running from `first` to `last`
    #[must_use]
    pub fn of(slot: SlotId, first: SlotId, last: SlotId) -> Self {
        match (slot == first, slot == last) {
            (true, true) => ChainRole::Sole,
            (true, false) => ChainRole::First,
            (false, true) => ChainRole::Last,
            (false, false) => ChainRole::Middle,
        }
    }

    #[must_use]
    pub fn is_first(self) -> bool {
        matches!(self, ChainRole::First | ChainRole::Sole)
    }

    #[must_use]
    pub fn is_last(self) -> bool {
        matches!(self, ChainRole::Last | ChainRole::Sole)
    }
}

/// Which backplane lines carry the multiblock token
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TokenPath {
    /// VXS P0 connector
    P0,
    /// VME P2 connector
    P2,
    /// The VME bus grant daisy chain (CAEN chained block transfers)
    Daisy,
}

/// What a family learns about a board when it identifies it
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Probe {
    /// Geographic slot as reported by the board
    pub slot: SlotId,
    pub firmware: u32,
}

/// Everything the readout engine keeps about one initialized board
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BoardHandle {
    pub slot: SlotId,
    /// A24 base address of the register window
    pub register_base: u32,
    /// Where the board serves its FIFO from
    pub fifo: (AddressSpace, u32),
    /// Firmware revision read at init
    pub firmware: u32,
    /// Set while multiblock readout is enabled
    pub role: Option<ChainRole>,
    /// Whether the board ends block transfers with a bus error
    pub bus_error_enabled: bool,
    /// Events per block
    pub block_level: u32,
    /// Blocks and data words read through this board. A multiboard read is one block, and it is
    /// booked in full on the first board of the chain since the transfer can't tell which board
    /// sourced which word.
    pub blocks_read: u64,
    pub words_read: u64,
}

impl BoardHandle {
    #[must_use]
    pub fn is_first_in_chain(&self) -> bool {
        self.role.is_some_and(ChainRole::is_first)
    }

    #[must_use]
    pub fn is_last_in_chain(&self) -> bool {
        self.role.is_some_and(ChainRole::is_last)
    }
}

/// The register-level behavior of one kind of board.
///
/// Every method is a short register sequence run with the family lock already held; none of
/// them take the lock themselves.
pub trait BoardFamily: Send + 'static {
    /// Human readable name used in logs and errors
    const NAME: &'static str;
    /// Key prefix of this family in crate configuration files (`F1` in `F1_BLOCK_LEVEL`)
    const CONFIG_PREFIX: &'static str;
    /// Oldest firmware the readout engine knows how to drive
    const MIN_FIRMWARE: u32;
    /// The dummy word written ahead of misaligned DMA destinations and returned by empty FIFOs
    const FILLER_WORD: u32;
    const MAX_BLOCK_LEVEL: u32;
    /// The token routings the board supports, empty if it can't do multiblock at all
    const TOKEN_PATHS: &'static [TokenPath];

    /// Snapshot of the board's status registers
    type Status: Display + Debug + Send;

    /// Try to identify a board of this family with its registers at `base`
    /// # Errors
    /// Returns `BusTimeout` when nothing answers at `base`, `Ok(None)` when something does but
    /// it is not one of ours
    fn probe<B: Bus>(bus: &mut B, base: u32) -> BusResult<Option<Probe>>;

    /// Where a board with registers at `base` serves its FIFO from, given the A32 address the
    /// registry assigned it
    fn fifo(base: u32, a32: u32) -> (AddressSpace, u32);

    /// Bring a freshly probed board into a known state: soft reset, FIFO window, block level
    /// and bus error preference from `handle`
    /// # Errors
    /// Returns an error on bus failures
    fn initialize<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<()>;

    /// # Errors
    /// Returns an error on bus failures
    fn set_bus_error<B: Bus>(bus: &mut B, handle: &BoardHandle, enable: bool) -> BusResult<()>;

    /// Did the last block transfer end with the board raising a bus error
    /// # Errors
    /// Returns an error on bus failures
    fn bus_error_status<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<bool>;

    /// Clear a latched bus error status, for boards that don't clear it on their own
    /// # Errors
    /// Returns an error on bus failures
    fn acknowledge_bus_error<B: Bus>(_bus: &mut B, _handle: &BoardHandle) -> BusResult<()> {
        Ok(())
    }

    /// Does this (host order) word close a block
    fn is_block_trailer(word: u32) -> bool;

    fn is_filler(word: u32) -> bool {
        word == Self::FILLER_WORD
    }

    /// Program the board's part in a chain served at `window`
    /// # Errors
    /// Returns an error on bus failures
    fn enable_multiblock<B: Bus>(
        bus: &mut B,
        handle: &BoardHandle,
        role: ChainRole,
        window: u32,
        path: TokenPath,
    ) -> BusResult<()>;

    /// # Errors
    /// Returns an error on bus failures
    fn disable_multiblock<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<()>;

    /// Hand the token back to the first board of the chain
    /// # Errors
    /// Returns an error on bus failures
    fn reset_token<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<()>;

    /// Whether the board currently holds the token, `None` if it can't tell
    /// # Errors
    /// Returns an error on bus failures
    fn has_token<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<Option<bool>>;

    /// Whether at least one complete block is waiting in the FIFO
    /// # Errors
    /// Returns an error on bus failures
    fn block_ready<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<bool>;

    /// # Errors
    /// Returns an error on bus failures
    fn set_block_level<B: Bus>(bus: &mut B, handle: &BoardHandle, level: u32) -> BusResult<()>;

    /// Throw away everything in the FIFO and the event counters
    /// # Errors
    /// Returns an error on bus failures
    fn clear<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<()>;

    /// # Errors
    /// Returns an error on bus failures
    fn status<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<Self::Status>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles() {
        assert_eq!(ChainRole::of(5, 5, 13), ChainRole::First);
        assert_eq!(ChainRole::of(9, 5, 13), ChainRole::Middle);
        assert_eq!(ChainRole::of(13, 5, 13), ChainRole::Last);
        assert_eq!(ChainRole::of(7, 7, 7), ChainRole::Sole);
        assert!(ChainRole::Sole.is_first() && ChainRole::Sole.is_last());
        assert!(!ChainRole::Middle.is_first() && !ChainRole::Middle.is_last());
    }
}
