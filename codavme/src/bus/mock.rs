//! Mock bus implementation used in testing the readout engine without a crate.
//!
//! The mock keeps a sparse byte memory for the register windows it has been told about and a set
//! of simulated boards, each with a FIFO of data blocks. DMA transfers out of a board FIFO (or a
//! multiblock chain window) behave the way the real boards do: a block that fits in the request
//! ends with the board raising its bus-error status, a block that doesn't is cut at the word
//! count and the rest stays behind in the FIFO.
//!
//! `Mock` is a cheap handle to shared state, so a test can keep a clone to stage data and inject
//! faults while a registry owns another clone.

use super::{
    AddressSpace,
    Bus,
    BusResult,
    DmaRequest,
    DmaWait,
    Error,
    Platform,
};
use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::Duration,
};
use crate::core::SlotId;

/// Board families that know how to build a simulated copy of themselves
pub trait Simulated {
    /// A board in `slot` running `firmware`, with registers at the A24 address `base` and its
    /// FIFO served from the A32 address `a32` (where the family uses one)
    fn simulate(slot: SlotId, firmware: u32, base: u32, a32: u32) -> SimBoard;
}

/// A single bit (or group of bits) in a simulated board's register
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Flag {
    pub space: AddressSpace,
    pub addr: u32,
    /// Width of the register in bytes
    pub width: usize,
    pub mask: u32,
}

/// Failures the mock can be told to produce on an upcoming DMA
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DmaFault {
    /// `start_dma` refuses to start
    Start,
    /// `wait_dma` returns the driver's negative error sentinel
    Sentinel,
    /// `wait_dma` gives up waiting
    Timeout,
    /// `wait_dma` fails outright
    Engine,
    /// The transfer goes through, but the board that ended it doesn't answer the next read of
    /// its bus error status
    StatusLost,
}

/// Description of one simulated board
#[derive(Debug, Clone)]
pub struct SimBoard {
    /// Geographic slot
    pub slot: u8,
    /// A24 base and span of the register window
    pub registers: (u32, u32),
    /// Where the board serves its FIFO from
    pub fifo: (AddressSpace, u32),
    /// Size of the FIFO window in bytes
    pub fifo_span: u32,
    /// Raised when the board ends a block transfer with a bus error
    pub bus_error: Flag,
    /// Writing this clears `bus_error`
    pub bus_error_clear: Option<Flag>,
    /// Reflects whether a block is waiting in the FIFO
    pub ready: Option<Flag>,
    /// Reflects whether the board holds the multiblock token
    pub token: Option<Flag>,
    /// Writing this returns the token to the first board of the chain
    pub token_return: Option<Flag>,
    /// Writing this empties the FIFO
    pub clear: Option<Flag>,
    /// What a programmed read of an empty FIFO returns
    pub empty_word: u32,
    /// Register values (A24 address, width, value) loaded when the board is inserted
    pub presets: Vec<(u32, usize, u32)>,
    blocks: VecDeque<Vec<u32>>,
}

impl SimBoard {
    /// A board in `slot` with registers at `base` and its FIFO at `fifo`, raising `bus_error` at
    /// the end of every block
    #[must_use]
    pub fn new(slot: u8, base: u32, span: u32, fifo: (AddressSpace, u32), bus_error: Flag) -> Self {
        Self {
            slot,
            registers: (base, span),
            fifo,
            fifo_span: 4,
            bus_error,
            bus_error_clear: None,
            ready: None,
            token: None,
            token_return: None,
            clear: None,
            empty_word: 0,
            presets: vec![],
            blocks: VecDeque::new(),
        }
    }

    fn serves(&self, space: AddressSpace, addr: u32) -> bool {
        self.fifo.0 == space && addr >= self.fifo.1 && addr - self.fifo.1 < self.fifo_span
    }
}

#[derive(Debug, Clone)]
struct Chain {
    window: u32,
    slots: Vec<u8>,
    /// Index into `slots` of the token holder
    token: usize,
}

#[derive(Debug, Default)]
struct State {
    memory: HashMap<(AddressSpace, u32), u8>,
    boards: Vec<SimBoard>,
    chain: Option<Chain>,
    platform: Platform,
    pending: Option<DmaRequest>,
    faults: VecDeque<DmaFault>,
    /// A register that times out on its next read
    dead: Option<(AddressSpace, u32)>,
    dma_log: Vec<DmaRequest>,
}

impl State {
    fn get(&self, space: AddressSpace, addr: u32, width: usize) -> Option<u32> {
        let mut value = 0u32;
        for i in 0..width {
            let byte = self.memory.get(&(space, addr + i as u32))?;
            value = (value << 8) | u32::from(*byte);
        }
        Some(value)
    }

    fn put(&mut self, space: AddressSpace, addr: u32, width: usize, value: u32) {
        let bytes = value.to_be_bytes();
        for (i, byte) in bytes[4 - width..].iter().enumerate() {
            self.memory.insert((space, addr + i as u32), *byte);
        }
    }

    fn set_flag(&mut self, flag: Flag, on: bool) {
        if let Some(value) = self.get(flag.space, flag.addr, flag.width) {
            let value = if on {
                value | flag.mask
            } else {
                value & !flag.mask
            };
            self.put(flag.space, flag.addr, flag.width, value);
        }
    }

    fn board_mut(&mut self, slot: u8) -> Option<&mut SimBoard> {
        self.boards.iter_mut().find(|b| b.slot == slot)
    }

    /// Bring the ready and token flags in line with the FIFOs and the chain
    fn refresh(&mut self) {
        let holder = self
            .chain
            .as_ref()
            .and_then(|c| c.slots.get(c.token).copied());
        let flags: Vec<_> = self
            .boards
            .iter()
            .map(|b| (b.ready, !b.blocks.is_empty(), b.token, holder == Some(b.slot)))
            .collect();
        for (ready, has_data, token, holds) in flags {
            if let Some(ready) = ready {
                self.set_flag(ready, has_data);
            }
            if let Some(token) = token {
                self.set_flag(token, holds);
            }
        }
    }

    fn pop_fifo_word(&mut self, idx: usize) -> u32 {
        let board = &mut self.boards[idx];
        let Some(block) = board.blocks.front_mut() else {
            return board.empty_word;
        };
        let word = if block.is_empty() {
            board.empty_word
        } else {
            block.remove(0)
        };
        if block.is_empty() {
            board.blocks.pop_front();
        }
        word
    }

    /// React to a register write the way the simulated boards would
    fn handle_write(&mut self, space: AddressSpace, addr: u32, width: usize, value: u32) {
        let hits = |flag: Option<Flag>| {
            flag.is_some_and(|f| {
                f.space == space && f.addr == addr && f.width == width && value & f.mask != 0
            })
        };
        let mut commands = vec![];
        let mut token_returned = false;
        for idx in 0..self.boards.len() {
            let board = &self.boards[idx];
            let (berr_clear, token_return, clear) =
                (board.bus_error_clear, board.token_return, board.clear);
            let bus_error = board.bus_error;
            if hits(berr_clear) {
                self.set_flag(bus_error, false);
                commands.extend(berr_clear);
            }
            if hits(token_return) {
                token_returned = true;
                commands.extend(token_return);
            }
            if hits(clear) {
                self.boards[idx].blocks.clear();
                commands.extend(clear);
            }
        }
        if token_returned {
            if let Some(chain) = self.chain.as_mut() {
                chain.token = 0;
            }
        }
        // Command bits are self-clearing
        for flag in commands {
            self.set_flag(flag, false);
        }
        self.refresh();
    }

    /// Drain up to `budget` words from the board at `idx`. Returns the words and whether the
    /// board ended the transfer with a bus error.
    fn drain_board(&mut self, idx: usize, budget: usize) -> (Vec<u32>, bool) {
        let board = &mut self.boards[idx];
        match board.blocks.pop_front() {
            // An empty FIFO bus-errors straight away
            None => (vec![], true),
            Some(block) if block.len() <= budget => (block, true),
            Some(mut block) => {
                let rest = block.split_off(budget);
                board.blocks.push_front(rest);
                (block, false)
            }
        }
    }

    /// Drain the multiblock chain starting from the token holder. Returns the words and the slot
    /// of the board that terminated the transfer with a bus error, if any.
    fn drain_chain(&mut self, mut budget: usize) -> (Vec<u32>, Option<u8>) {
        let Some(mut chain) = self.chain.clone() else {
            return (vec![], None);
        };
        let mut words = vec![];
        let mut finished = true;
        while chain.token < chain.slots.len() {
            let slot = chain.slots[chain.token];
            if let Some(board) = self.board_mut(slot) {
                if let Some(mut block) = board.blocks.pop_front() {
                    if block.len() > budget {
                        let rest = block.split_off(budget);
                        board.blocks.push_front(rest);
                        words.extend(block);
                        finished = false;
                        break;
                    }
                    budget -= block.len();
                    words.extend(block);
                }
            }
            // The last board keeps the token and terminates the transaction
            if chain.token + 1 == chain.slots.len() {
                break;
            }
            chain.token += 1;
        }
        let terminator = if finished {
            chain.slots.last().copied()
        } else {
            None
        };
        self.chain = Some(chain);
        (words, terminator)
    }
}

/// A simulated VME crate, useful for testing
#[derive(Debug, Clone, Default)]
pub struct Mock {
    inner: Arc<Mutex<State>>,
}

impl Mock {
    /// Construct an empty mock crate using the Linux driver conventions
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct an empty mock crate whose DMA waits follow `platform` conventions
    #[must_use]
    pub fn with_platform(platform: Platform) -> Self {
        let mock = Self::default();
        mock.state().platform = platform;
        mock
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `len` bytes from `base` respond (with zeros) to single cycles
    pub fn map(&self, space: AddressSpace, base: u32, len: u32) {
        let mut state = self.state();
        for addr in base..base + len {
            state.memory.insert((space, addr), 0);
        }
    }

    /// Plug a simulated board into the crate
    pub fn insert_board(&self, board: SimBoard) {
        let (base, span) = board.registers;
        self.map(AddressSpace::A24, base, span);
        let mut state = self.state();
        for (addr, width, value) in &board.presets {
            state.put(AddressSpace::A24, *addr, *width, *value);
        }
        state.boards.retain(|b| b.slot != board.slot);
        state.boards.push(board);
        state.refresh();
    }

    /// Wire the boards in `slots` (first to last) into a multiblock chain served at the A32
    /// address `window`. The token starts on the first board.
    pub fn set_chain(&self, window: u32, slots: &[u8]) {
        let mut state = self.state();
        state.chain = Some(Chain {
            window,
            slots: slots.to_vec(),
            token: 0,
        });
        state.refresh();
    }

    /// Queue a block of (host order) words in the FIFO of the board in `slot`
    pub fn push_block(&self, slot: u8, words: &[u32]) {
        let mut state = self.state();
        if let Some(board) = state.board_mut(slot) {
            board.blocks.push_back(words.to_vec());
        }
        state.refresh();
    }

    /// Number of blocks (or block remainders) still waiting in the FIFO of `slot`
    #[must_use]
    pub fn pending_blocks(&self, slot: u8) -> usize {
        let state = self.state();
        state
            .boards
            .iter()
            .find(|b| b.slot == slot)
            .map_or(0, |b| b.blocks.len())
    }

    /// Queue a fault for an upcoming DMA
    pub fn inject(&self, fault: DmaFault) {
        self.state().faults.push_back(fault);
    }

    /// Every DMA request started so far
    #[must_use]
    pub fn dma_log(&self) -> Vec<DmaRequest> {
        self.state().dma_log.clone()
    }

    /// The slot of the board holding the chain token
    #[must_use]
    pub fn token_slot(&self) -> Option<u8> {
        let state = self.state();
        state
            .chain
            .as_ref()
            .and_then(|c| c.slots.get(c.token).copied())
    }

    /// Look at a register without going through a bus cycle
    #[must_use]
    pub fn peek(&self, space: AddressSpace, addr: u32, width: usize) -> Option<u32> {
        self.state().get(space, addr, width)
    }

    /// Make the next single cycle read of `addr` time out, as if the board stopped answering
    pub fn fail_next_read(&self, space: AddressSpace, addr: u32) {
        self.state().dead = Some((space, addr));
    }

    /// Set a register without going through a bus cycle
    pub fn poke(&self, space: AddressSpace, addr: u32, width: usize, value: u32) {
        self.state().put(space, addr, width, value);
    }
}

impl Bus for Mock {
    fn read_bytes<const N: usize>(
        &mut self,
        space: AddressSpace,
        addr: u32,
    ) -> BusResult<[u8; N]> {
        if !matches!(N, 1 | 2 | 4) {
            return Err(Error::Width(N));
        }
        let mut state = self.state();
        let mut bytes = [0u8; N];
        if N == 4 {
            if let Some(idx) = state.boards.iter().position(|b| b.serves(space, addr)) {
                let word = state.pop_fifo_word(idx);
                state.refresh();
                bytes.copy_from_slice(&word.to_be_bytes());
                return Ok(bytes);
            }
        }
        if state.dead == Some((space, addr)) {
            state.dead = None;
            return Err(Error::BusTimeout { space, addr });
        }
        let value = state
            .get(space, addr, N)
            .ok_or(Error::BusTimeout { space, addr })?;
        bytes.copy_from_slice(&value.to_be_bytes()[4 - N..]);
        Ok(bytes)
    }

    fn write_bytes(&mut self, space: AddressSpace, addr: u32, data: &[u8]) -> BusResult<()> {
        let width = data.len();
        if !matches!(width, 1 | 2 | 4) {
            return Err(Error::Width(width));
        }
        let mut state = self.state();
        if state.get(space, addr, width).is_none() {
            return Err(Error::BusTimeout { space, addr });
        }
        let value = data.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
        state.put(space, addr, width, value);
        state.handle_write(space, addr, width, value);
        Ok(())
    }

    fn start_dma(&mut self, request: &DmaRequest) -> BusResult<()> {
        let mut state = self.state();
        if state.faults.front() == Some(&DmaFault::Start) {
            state.faults.pop_front();
            return Err(Error::DmaStart("injected start failure".to_owned()));
        }
        // Bus error status is latched per transfer
        let flags: Vec<_> = state.boards.iter().map(|b| b.bus_error).collect();
        for flag in flags {
            state.set_flag(flag, false);
        }
        state.pending = Some(*request);
        state.dma_log.push(*request);
        Ok(())
    }

    fn wait_dma(&mut self, dest: &mut [u32], timeout: Duration) -> BusResult<DmaWait> {
        let mut state = self.state();
        let request = state.pending.take().ok_or(Error::NoTransfer)?;
        let platform = state.platform;
        let fault = state.faults.pop_front();
        match fault {
            Some(DmaFault::Sentinel) => return Ok(DmaWait { platform, raw: -1 }),
            Some(DmaFault::Timeout) => return Err(Error::DmaTimeout(timeout)),
            Some(DmaFault::Engine) => {
                return Err(Error::DmaEngine("injected engine failure".to_owned()))
            }
            Some(DmaFault::Start | DmaFault::StatusLost) | None => {}
        }
        let budget = (request.nbytes / 4).min(dest.len());
        let board = state
            .boards
            .iter()
            .position(|b| b.fifo == (request.space, request.source));
        let in_chain = state.chain.as_ref().is_some_and(|c| {
            request.space == AddressSpace::A32 && c.window == request.source
        });
        let (words, terminator) = if let Some(idx) = board {
            let (words, berr) = state.drain_board(idx, budget);
            (words, berr.then_some(idx))
        } else if in_chain {
            let (words, slot) = state.drain_chain(budget);
            let idx = slot.and_then(|s| state.boards.iter().position(|b| b.slot == s));
            (words, idx)
        } else {
            return Err(Error::DmaEngine(format!(
                "no board answers at {:?} {:#010x}",
                request.space, request.source
            )));
        };
        if let Some(idx) = terminator {
            let flag = state.boards[idx].bus_error;
            state.set_flag(flag, true);
            if fault == Some(DmaFault::StatusLost) {
                state.dead = Some((flag.space, flag.addr));
            }
        }
        state.refresh();
        for (slot, word) in dest.iter_mut().zip(&words) {
            // Words land in memory exactly as they sat on the bus
            *slot = u32::from_ne_bytes(word.to_be_bytes());
        }
        let transferred = words.len() * 4;
        let raw = match platform {
            Platform::Linux => transferred,
            Platform::VxWorks if terminator.is_some() => request.nbytes - transferred,
            Platform::VxWorks => 0,
        };
        Ok(DmaWait {
            platform,
            raw: i32::try_from(raw).unwrap_or(i32::MAX),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u32 = 0x28_0000;
    const FIFO: u32 = 0x0800_0000;

    fn berr_flag() -> Flag {
        Flag {
            space: AddressSpace::A24,
            addr: BASE + 0x4,
            width: 4,
            mask: 0x4,
        }
    }

    fn board(slot: u8, base: u32, fifo: u32) -> SimBoard {
        let mut b = SimBoard::new(
            slot,
            base,
            0x100,
            (AddressSpace::A32, fifo),
            Flag {
                addr: base + 0x4,
                ..berr_flag()
            },
        );
        b.fifo_span = 0x1000;
        b.token = Some(Flag {
            addr: base + 0x4,
            mask: 0x10,
            ..berr_flag()
        });
        b.token_return = Some(Flag {
            addr: base + 0x8,
            mask: 0x1,
            ..berr_flag()
        });
        b
    }

    fn host(words: &[u32]) -> Vec<u32> {
        words.iter().map(|w| u32::from_be(*w)).collect()
    }

    #[test]
    fn test_read() {
        let mut bus = Mock::new();
        bus.map(AddressSpace::A24, BASE, 4);
        let bytes: [u8; 4] = bus.read_bytes(AddressSpace::A24, BASE).unwrap();
        assert_eq!(bytes, [0, 0, 0, 0]);
    }

    #[test]
    fn test_write_read_offset() {
        let mut bus = Mock::new();
        bus.map(AddressSpace::A24, BASE, 4);
        bus.write_bytes(AddressSpace::A24, BASE + 2, &[7, 8]).unwrap();
        let bytes: [u8; 4] = bus.read_bytes(AddressSpace::A24, BASE).unwrap();
        assert_eq!(bytes, [0, 0, 7, 8]);
        let bytes: [u8; 2] = bus.read_bytes(AddressSpace::A24, BASE + 2).unwrap();
        assert_eq!(bytes, [7, 8]);
    }

    #[test]
    fn test_bad_width() {
        let mut bus = Mock::new();
        bus.map(AddressSpace::A24, BASE, 8);
        let res: BusResult<[u8; 3]> = bus.read_bytes(AddressSpace::A24, BASE);
        assert!(matches!(res, Err(Error::Width(3))));
    }

    #[test]
    fn test_programmed_fifo_reads() {
        let mut bus = Mock::new();
        let mut b = board(5, BASE, FIFO);
        b.empty_word = 0xF800_0000;
        bus.insert_board(b);
        bus.push_block(5, &[1, 2]);
        let words: Vec<u32> = (0..3)
            .map(|_| bus.read(AddressSpace::A32, FIFO).unwrap())
            .collect();
        assert_eq!(words, [1, 2, 0xF800_0000]);
    }

    #[test]
    fn test_dma_block_ends_in_bus_error() {
        let mut bus = Mock::new();
        bus.insert_board(board(5, BASE, FIFO));
        bus.push_block(5, &[10, 11, 12]);
        let request = DmaRequest {
            space: AddressSpace::A32,
            source: FIFO,
            local_addr: 0,
            nbytes: 40,
        };
        bus.start_dma(&request).unwrap();
        let mut dest = [0u32; 10];
        let wait = bus.wait_dma(&mut dest, Duration::from_secs(1)).unwrap();
        assert_eq!(wait.raw, 12);
        assert_eq!(host(&dest[..3]), [10, 11, 12]);
        assert_eq!(bus.peek(AddressSpace::A24, BASE + 4, 4).unwrap() & 0x4, 0x4);
    }

    #[test]
    fn test_dma_cut_by_word_count() {
        let mut bus = Mock::with_platform(Platform::VxWorks);
        bus.insert_board(board(5, BASE, FIFO));
        bus.push_block(5, &[1, 2, 3, 4, 5]);
        let request = DmaRequest {
            space: AddressSpace::A32,
            source: FIFO,
            local_addr: 0,
            nbytes: 8,
        };
        bus.start_dma(&request).unwrap();
        let mut dest = [0u32; 2];
        let wait = bus.wait_dma(&mut dest, Duration::from_secs(1)).unwrap();
        assert_eq!(wait.raw, 0);
        assert_eq!(bus.pending_blocks(5), 1);
        assert_eq!(bus.peek(AddressSpace::A24, BASE + 4, 4).unwrap() & 0x4, 0);
    }

    #[test]
    fn test_chain_drain_and_token_return() {
        let mut bus = Mock::new();
        bus.insert_board(board(3, 0x18_0000, 0x0818_0000));
        bus.insert_board(board(4, 0x20_0000, 0x0820_0000));
        bus.set_chain(0x0A00_0000, &[3, 4]);
        bus.push_block(3, &[1, 2]);
        bus.push_block(4, &[3]);
        assert_eq!(bus.token_slot(), Some(3));
        let request = DmaRequest {
            space: AddressSpace::A32,
            source: 0x0A00_0000,
            local_addr: 0,
            nbytes: 64,
        };
        bus.start_dma(&request).unwrap();
        let mut dest = [0u32; 16];
        let wait = bus.wait_dma(&mut dest, Duration::from_secs(1)).unwrap();
        assert_eq!(wait.raw, 12);
        assert_eq!(host(&dest[..3]), [1, 2, 3]);
        // The last board terminated the transfer and still holds the token
        assert_eq!(bus.token_slot(), Some(4));
        assert_eq!(bus.peek(AddressSpace::A24, 0x20_0004, 4).unwrap() & 0x14, 0x14);
        bus.write(AddressSpace::A24, 0x18_0008, &1u32).unwrap();
        assert_eq!(bus.token_slot(), Some(3));
        assert_eq!(bus.peek(AddressSpace::A24, 0x18_0008, 4), Some(0));
    }

    #[test]
    fn test_injected_faults() {
        let mut bus = Mock::new();
        bus.insert_board(board(5, BASE, FIFO));
        let request = DmaRequest {
            space: AddressSpace::A32,
            source: FIFO,
            local_addr: 0,
            nbytes: 4,
        };
        bus.inject(DmaFault::Start);
        assert!(matches!(bus.start_dma(&request), Err(Error::DmaStart(_))));
        bus.inject(DmaFault::Sentinel);
        bus.start_dma(&request).unwrap();
        let wait = bus.wait_dma(&mut [0u32; 1], Duration::from_secs(1)).unwrap();
        assert_eq!(wait.raw, -1);
        assert!(matches!(
            bus.wait_dma(&mut [0u32; 1], Duration::from_secs(1)),
            Err(Error::NoTransfer)
        ));
    }
}
