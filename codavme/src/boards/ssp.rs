//! Routines for the JLab VXS Subsystem Processor (SSP).
//!
//! Readout goes through the event builder at `0x2000`, which blocks up trigger data in the JLab
//! format and serves it from an A32 window. The token only travels over the VXS P0 lanes.

use super::jlab;
use crate::{
    board::{
        BoardFamily,
        BoardHandle,
        ChainRole,
        Probe,
        TokenPath,
    },
    bus::{
        mock::{
            Flag,
            SimBoard,
            Simulated,
        },
        AddressSpace,
        Bus,
        BusResult,
        Deserialize,
        Offset,
        Serialize,
    },
    core::SlotId,
};
use codavme_derive::{
    offset,
    RegisterSerde,
};
use packed_struct::prelude::*;
use std::fmt;

/// "SSP " in ASCII
const BOARD_ID: u32 = 0x5353_5020;

#[offset(0x0)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct BoardId {
    #[packed_field(bits = "0..=31")]
    pub id: u32,
}

#[offset(0x4)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct FirmwareRev {
    #[packed_field(bits = "0..=15")]
    pub revision: u16,
}

#[offset(0x8)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct Geo {
    #[packed_field(bits = "0..=4")]
    pub slot: Integer<u8, packed_bits::Bits<5>>,
}

#[offset(0x10)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct Reset {
    #[packed_field(bits = "0")]
    pub soft_reset: bool,
    #[packed_field(bits = "1")]
    pub clear_event_builder: bool,
}

#[offset(0x2000)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct BlockCfg {
    #[packed_field(bits = "0..=7")]
    pub level: u8,
}

/// A32 address of the board's FIFO window, in units of 64 kB
#[offset(0x2004)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct Adr32 {
    #[packed_field(bits = "0")]
    pub enable: bool,
    #[packed_field(bits = "16..=31")]
    pub base: u16,
}

/// Range of A32 addresses the board answers to in multiblock mode, in units of 8 MB
#[offset(0x2008)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct Adr32M {
    #[packed_field(bits = "0")]
    pub enable: bool,
    #[packed_field(bits = "7..=15")]
    pub max: Integer<u16, packed_bits::Bits<9>>,
    #[packed_field(bits = "23..=31")]
    pub min: Integer<u16, packed_bits::Bits<9>>,
}

#[offset(0x2010)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct ReadoutCfg {
    #[packed_field(bits = "0")]
    pub bus_error_enable: bool,
    #[packed_field(bits = "1")]
    pub multiblock: bool,
    #[packed_field(bits = "2")]
    pub first_board: bool,
    #[packed_field(bits = "3")]
    pub last_board: bool,
}

#[offset(0x2014)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct ReadoutStatus {
    #[packed_field(bits = "0")]
    pub block_ready: bool,
    #[packed_field(bits = "1")]
    pub bus_error: bool,
    #[packed_field(bits = "2")]
    pub token: bool,
}

#[offset(0x2018)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct TokenCtrl {
    #[packed_field(bits = "0")]
    pub token_return: bool,
}

macro_rules! counter {
    ($name:ident, $addr:literal) => {
        #[offset($addr)]
        #[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
        #[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
        pub struct $name {
            #[packed_field(bits = "0..=31")]
            pub count: u32,
        }
    };
}

counter!(WordCount, 0x2024);
counter!(EventCount, 0x2028);
counter!(BlockCount, 0x202C);

#[allow(clippy::cast_possible_truncation)]
fn page_64k(addr: u32) -> u16 {
    (addr >> 16) as u16
}

/// The 8 MB page of an A32 address
#[allow(clippy::cast_possible_truncation)]
fn page_8m(addr: u32) -> Integer<u16, packed_bits::Bits<9>> {
    ((addr >> 23) as u16).into()
}

/// Snapshot of an SSP's event builder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SspStatus {
    pub slot: SlotId,
    pub firmware: u16,
    pub block_ready: bool,
    pub bus_error_enabled: bool,
    pub multiblock: bool,
    pub token: bool,
    pub block_level: u8,
    pub words: u32,
    pub events: u32,
    pub blocks: u32,
}

impl fmt::Display for SspStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SSP in slot {} (firmware {:#06x})", self.slot, self.firmware)?;
        writeln!(
            f,
            "  block level {}, BERR {}, multiblock {}, token {}",
            self.block_level,
            if self.bus_error_enabled { "on" } else { "off" },
            if self.multiblock { "on" } else { "off" },
            if self.token { "held" } else { "-" },
        )?;
        write!(
            f,
            "  {} blocks / {} events / {} words pending{}",
            self.blocks,
            self.events,
            self.words,
            if self.block_ready { ", block ready" } else { "" }
        )
    }
}

/// The VXS Subsystem Processor
#[derive(Debug, Copy, Clone)]
pub struct Ssp;

impl BoardFamily for Ssp {
    const NAME: &'static str = "SSP";
    const CONFIG_PREFIX: &'static str = "SSP";
    const MIN_FIRMWARE: u32 = 0x0103;
    const FILLER_WORD: u32 = 0xF800_0000;
    const MAX_BLOCK_LEVEL: u32 = 255;
    const TOKEN_PATHS: &'static [TokenPath] = &[TokenPath::P0];

    type Status = SspStatus;

    fn probe<B: Bus>(bus: &mut B, base: u32) -> BusResult<Option<Probe>> {
        let id: BoardId = bus.read_reg(base)?;
        if id.id != BOARD_ID {
            return Ok(None);
        }
        let rev: FirmwareRev = bus.read_reg(base)?;
        let slot: Geo = bus.read_reg(base)?;
        Ok(Some(Probe {
            slot: *slot.slot,
            firmware: u32::from(rev.revision),
        }))
    }

    fn fifo(_base: u32, a32: u32) -> (AddressSpace, u32) {
        (AddressSpace::A32, a32)
    }

    fn initialize<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<()> {
        let base = handle.register_base;
        bus.write_reg(
            base,
            &Reset {
                soft_reset: true,
                clear_event_builder: true,
            },
        )?;
        bus.write_reg(base, &Reset::default())?;
        bus.write_reg(
            base,
            &Adr32 {
                enable: true,
                base: page_64k(handle.fifo.1),
            },
        )?;
        Self::set_block_level(bus, handle, handle.block_level)?;
        bus.write_reg(
            base,
            &ReadoutCfg {
                bus_error_enable: handle.bus_error_enabled,
                ..Default::default()
            },
        )
    }

    fn set_bus_error<B: Bus>(bus: &mut B, handle: &BoardHandle, enable: bool) -> BusResult<()> {
        let mut cfg: ReadoutCfg = bus.read_reg(handle.register_base)?;
        cfg.bus_error_enable = enable;
        bus.write_reg(handle.register_base, &cfg)
    }

    fn bus_error_status<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<bool> {
        let status: ReadoutStatus = bus.read_reg(handle.register_base)?;
        Ok(status.bus_error)
    }

    fn is_block_trailer(word: u32) -> bool {
        jlab::is_block_trailer(word)
    }

    fn is_filler(word: u32) -> bool {
        jlab::is_filler(word)
    }

    fn enable_multiblock<B: Bus>(
        bus: &mut B,
        handle: &BoardHandle,
        role: ChainRole,
        window: u32,
        _path: TokenPath,
    ) -> BusResult<()> {
        let base = handle.register_base;
        bus.write_reg(
            base,
            &Adr32M {
                enable: true,
                min: page_8m(window),
                max: page_8m(window),
            },
        )?;
        bus.write_reg(
            base,
            &ReadoutCfg {
                bus_error_enable: role.is_last(),
                multiblock: true,
                first_board: role.is_first(),
                last_board: role.is_last(),
            },
        )
    }

    fn disable_multiblock<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<()> {
        let base = handle.register_base;
        let mut cfg: ReadoutCfg = bus.read_reg(base)?;
        cfg.multiblock = false;
        cfg.first_board = false;
        cfg.last_board = false;
        bus.write_reg(base, &cfg)?;
        bus.write_reg(base, &Adr32M::default())
    }

    fn reset_token<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<()> {
        bus.write_reg(handle.register_base, &TokenCtrl { token_return: true })
    }

    fn has_token<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<Option<bool>> {
        let status: ReadoutStatus = bus.read_reg(handle.register_base)?;
        Ok(Some(status.token))
    }

    fn block_ready<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<bool> {
        let status: ReadoutStatus = bus.read_reg(handle.register_base)?;
        Ok(status.block_ready)
    }

    fn set_block_level<B: Bus>(bus: &mut B, handle: &BoardHandle, level: u32) -> BusResult<()> {
        bus.write_reg(
            handle.register_base,
            &BlockCfg {
                level: u8::try_from(level).unwrap_or(u8::MAX),
            },
        )
    }

    fn clear<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<()> {
        let base = handle.register_base;
        bus.write_reg(
            base,
            &Reset {
                clear_event_builder: true,
                ..Default::default()
            },
        )?;
        bus.write_reg(base, &Reset::default())
    }

    fn status<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<SspStatus> {
        let base = handle.register_base;
        let rev: FirmwareRev = bus.read_reg(base)?;
        let cfg: ReadoutCfg = bus.read_reg(base)?;
        let status: ReadoutStatus = bus.read_reg(base)?;
        let level: BlockCfg = bus.read_reg(base)?;
        let words: WordCount = bus.read_reg(base)?;
        let events: EventCount = bus.read_reg(base)?;
        let blocks: BlockCount = bus.read_reg(base)?;
        Ok(SspStatus {
            slot: handle.slot,
            firmware: rev.revision,
            block_ready: status.block_ready,
            bus_error_enabled: cfg.bus_error_enable,
            multiblock: cfg.multiblock,
            token: status.token,
            block_level: level.level,
            words: words.count,
            events: events.count,
            blocks: blocks.count,
        })
    }
}

impl Simulated for Ssp {
    fn simulate(slot: SlotId, firmware: u32, base: u32, a32: u32) -> SimBoard {
        let flag = |offset, mask| Flag {
            space: AddressSpace::A24,
            addr: base + offset,
            width: 4,
            mask,
        };
        let status = ReadoutStatus::offset();
        let mut board = SimBoard::new(
            slot,
            base,
            0x2100,
            (AddressSpace::A32, a32),
            flag(status, 1 << 1),
        );
        board.fifo_span = 0x1000;
        board.ready = Some(flag(status, 1 << 0));
        board.token = Some(flag(status, 1 << 2));
        board.token_return = Some(flag(TokenCtrl::offset(), 1 << 0));
        board.clear = Some(flag(Reset::offset(), 1 << 1));
        board.empty_word = Self::FILLER_WORD;
        board.presets = vec![
            (base + BoardId::offset(), 4, BOARD_ID),
            (base + FirmwareRev::offset(), 4, firmware & 0xFFFF),
            (base + Geo::offset(), 4, u32::from(slot)),
        ];
        board
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::mock::Mock,
        readout::{
            classify::OutcomeKind,
            ReadMode,
        },
        registry::BoardRegistry,
        testing::{
            base,
            options,
            Aligned,
        },
    };

    #[test]
    fn test_adr32_pages() {
        let reg = Adr32 {
            enable: true,
            base: page_64k(0x0848_0000),
        };
        assert_eq!(reg.serialize().unwrap(), [0x08, 0x48, 0x00, 0x01]);
        let reg = Adr32M {
            enable: true,
            min: page_8m(0x0A00_0000),
            max: page_8m(0x0A00_0000),
        };
        assert_eq!(u32::from_be_bytes(reg.serialize().unwrap()), 0x0A00_0A01);
    }

    #[test]
    fn test_counters() {
        let count = EventCount::deserialize([0, 0, 1, 2]).unwrap();
        assert_eq!(count.count, 0x102);
        assert_eq!(BlockCount::offset(), 0x202C);
    }

    fn ssp_crate(slots: &[SlotId]) -> (Mock, BoardRegistry<Mock, Ssp>) {
        let mock = Mock::new();
        let opts = options();
        for &slot in slots {
            mock.insert_board(Ssp::simulate(slot, 0x0201, base(slot), opts.a32_for(slot)));
        }
        let bases: Vec<_> = slots.iter().map(|s| base(*s)).collect();
        let registry = BoardRegistry::init(mock.clone(), &bases, opts).unwrap();
        (mock, registry)
    }

    #[test]
    fn test_readout() {
        let (mock, registry) = ssp_crate(&[9]);
        let block = [
            jlab::block_header(9, 1, 1),
            jlab::event_header(9, 1),
            0x0000_0042,
            jlab::block_trailer(9, 4),
        ];
        mock.push_block(9, &block);
        assert!(registry.data_ready(9).unwrap());
        let mut buf = Aligned::default();
        let outcome = registry
            .read_block(9, &mut buf.0, 64, ReadMode::SingleBoardDma)
            .unwrap();
        assert_eq!(outcome.kind, OutcomeKind::TerminatedByBusError);
        assert_eq!(outcome.data(&buf.0), block);
    }

    #[test]
    fn test_multiblock() {
        let (mock, registry) = ssp_crate(&[14, 16]);
        let chain = registry.enable_multiblock(TokenPath::P0).unwrap();
        mock.set_chain(chain.window, &[14, 16]);
        assert_eq!(registry.handle(16).unwrap().role, Some(ChainRole::Last));
        let status = registry.status(14).unwrap();
        assert!(status.multiblock && !status.bus_error_enabled && status.token);
        assert_eq!(registry.token_holders().unwrap(), [14]);
        assert!(status.to_string().starts_with("SSP in slot 14"));
    }
}
