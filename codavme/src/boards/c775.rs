//! Routines for the CAEN V775 TDC.
//!
//! The V775 is a plain VME board: 16 bit registers in A24 and an output buffer at the bottom of
//! its own register window. It has no token of its own. Chained block transfers (CBLT) ride the
//! bus grant daisy chain, so the token can't be reset or inspected.
//!
//! Data words carry their type in bits 24..=26: 2 is an event header, 0 a datum, 4 the end of
//! event (our block trailer, since the board is always run one event per block) and 6 the
//! "not valid datum" an empty buffer answers with.

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
use tracing::trace;

/// Board identifier in the configuration ROM, 775 = 0x000307
const BOARD_ID: [u8; 3] = [0x00, 0x03, 0x07];

const TYPE_HEADER: u32 = 2;
const TYPE_END_OF_EVENT: u32 = 4;
const TYPE_NOT_VALID: u32 = 6;

fn word_type(word: u32) -> u32 {
    (word >> 24) & 0x7
}

#[offset(0x1000)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "2", endian = "msb")]
pub struct FirmwareRev {
    #[packed_field(bits = "0..=15")]
    pub revision: u16,
}

#[offset(0x1002)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "2")]
pub struct Geo {
    #[packed_field(bits = "0..=4")]
    pub slot: Integer<u8, packed_bits::Bits<5>>,
}

/// Bits 24..=31 of the A32 address chained transfers are served at
#[offset(0x1004)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "2")]
pub struct McstCbltAddress {
    #[packed_field(bits = "0..=7")]
    pub address: u8,
}

macro_rules! bit_set_1 {
    ($name:ident, $addr:literal) => {
        #[offset($addr)]
        #[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
        #[packed_struct(bit_numbering = "lsb0", size_bytes = "2")]
        pub struct $name {
            #[packed_field(bits = "3")]
            pub bus_error: bool,
            #[packed_field(bits = "4")]
            pub select_address: bool,
            #[packed_field(bits = "7")]
            pub soft_reset: bool,
        }
    };
}

bit_set_1!(BitSet1, 0x1006);
bit_set_1!(BitClear1, 0x1008);

#[offset(0x100E)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "2")]
pub struct Status1 {
    #[packed_field(bits = "0")]
    pub data_ready: bool,
    #[packed_field(bits = "1")]
    pub global_data_ready: bool,
    #[packed_field(bits = "2")]
    pub busy: bool,
    #[packed_field(bits = "3")]
    pub global_busy: bool,
    #[packed_field(bits = "5")]
    pub purged: bool,
}

#[offset(0x1010)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "2")]
pub struct Control1 {
    /// End block transfers after one event
    #[packed_field(bits = "2")]
    pub block_end: bool,
    #[packed_field(bits = "4")]
    pub program_reset: bool,
    #[packed_field(bits = "5")]
    pub bus_error_enable: bool,
    #[packed_field(bits = "6")]
    pub align64: bool,
}

#[derive(PrimitiveEnum_u8, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CbltMode {
    #[default]
    Disabled = 0,
    Last = 1,
    First = 2,
    Middle = 3,
}

impl From<ChainRole> for CbltMode {
    fn from(role: ChainRole) -> Self {
        match role {
            ChainRole::First => CbltMode::First,
            ChainRole::Middle => CbltMode::Middle,
            // A chain of one has to end the transfer itself
            ChainRole::Last | ChainRole::Sole => CbltMode::Last,
        }
    }
}

#[offset(0x101A)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "2")]
pub struct McstCbltCtrl {
    #[packed_field(bits = "0..=1", ty = "enum")]
    pub mode: CbltMode,
}

#[offset(0x1024)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "2", endian = "msb")]
pub struct EventCounterLow {
    #[packed_field(bits = "0..=15")]
    pub count: u16,
}

#[offset(0x1026)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "2")]
pub struct EventCounterHigh {
    #[packed_field(bits = "0..=7")]
    pub count: u8,
}

macro_rules! bit_set_2 {
    ($name:ident, $addr:literal) => {
        #[offset($addr)]
        #[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
        #[packed_struct(bit_numbering = "lsb0", size_bytes = "2")]
        pub struct $name {
            #[packed_field(bits = "1")]
            pub offline: bool,
            #[packed_field(bits = "2")]
            pub clear_data: bool,
        }
    };
}

bit_set_2!(BitSet2, 0x1032);
bit_set_2!(BitClear2, 0x1034);

macro_rules! rom_byte {
    ($name:ident, $addr:literal) => {
        #[offset($addr)]
        #[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
        #[packed_struct(bit_numbering = "lsb0", size_bytes = "2")]
        pub struct $name {
            #[packed_field(bits = "0..=7")]
            pub value: u8,
        }
    };
}

rom_byte!(BoardIdMsb, 0x8036);
rom_byte!(BoardIdMid, 0x803A);
rom_byte!(BoardIdLsb, 0x803E);

/// Snapshot of a V775's status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct C775Status {
    pub slot: SlotId,
    pub firmware: u16,
    pub data_ready: bool,
    pub busy: bool,
    pub bus_error_enabled: bool,
    pub cblt: CbltMode,
    pub event_count: u32,
}

impl fmt::Display for C775Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "V775 slot {} (firmware {:#06x}): {} events, {}{}, CBLT {:?}",
            self.slot,
            self.firmware,
            self.event_count,
            match (self.data_ready, self.busy) {
                (_, true) => "busy",
                (true, false) => "data ready",
                (false, false) => "empty",
            },
            if self.bus_error_enabled { ", BERR" } else { "" },
            self.cblt,
        )
    }
}

/// The CAEN V775 TDC
#[derive(Debug, Copy, Clone)]
pub struct C775;

impl BoardFamily for C775 {
    const NAME: &'static str = "V775";
    const CONFIG_PREFIX: &'static str = "C775";
    const MIN_FIRMWARE: u32 = 0x0500;
    const FILLER_WORD: u32 = TYPE_NOT_VALID << 24;
    const MAX_BLOCK_LEVEL: u32 = 1;
    const TOKEN_PATHS: &'static [TokenPath] = &[TokenPath::Daisy];

    type Status = C775Status;

    fn probe<B: Bus>(bus: &mut B, base: u32) -> BusResult<Option<Probe>> {
        let msb: BoardIdMsb = bus.read_reg(base)?;
        let mid: BoardIdMid = bus.read_reg(base)?;
        let lsb: BoardIdLsb = bus.read_reg(base)?;
        if [msb.value, mid.value, lsb.value] != BOARD_ID {
            return Ok(None);
        }
        let rev: FirmwareRev = bus.read_reg(base)?;
        let geo: Geo = bus.read_reg(base)?;
        Ok(Some(Probe {
            slot: *geo.slot,
            firmware: u32::from(rev.revision),
        }))
    }

    fn fifo(base: u32, _a32: u32) -> (AddressSpace, u32) {
        (AddressSpace::A24, base)
    }

    fn initialize<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<()> {
        let base = handle.register_base;
        bus.write_reg(
            base,
            &BitSet1 {
                soft_reset: true,
                ..Default::default()
            },
        )?;
        bus.write_reg(
            base,
            &BitClear1 {
                soft_reset: true,
                ..Default::default()
            },
        )?;
        Self::clear(bus, handle)?;
        bus.write_reg(base, &McstCbltCtrl::default())?;
        bus.write_reg(
            base,
            &Control1 {
                block_end: true,
                bus_error_enable: handle.bus_error_enabled,
                ..Default::default()
            },
        )?;
        trace!("V775 slot {} initialized", handle.slot);
        Ok(())
    }

    fn set_bus_error<B: Bus>(bus: &mut B, handle: &BoardHandle, enable: bool) -> BusResult<()> {
        let mut ctrl: Control1 = bus.read_reg(handle.register_base)?;
        ctrl.bus_error_enable = enable;
        bus.write_reg(handle.register_base, &ctrl)
    }

    fn bus_error_status<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<bool> {
        let set: BitSet1 = bus.read_reg(handle.register_base)?;
        Ok(set.bus_error)
    }

    // The flag stays up until it is cleared by hand
    fn acknowledge_bus_error<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<()> {
        bus.write_reg(
            handle.register_base,
            &BitClear1 {
                bus_error: true,
                ..Default::default()
            },
        )
    }

    fn is_block_trailer(word: u32) -> bool {
        word_type(word) == TYPE_END_OF_EVENT
    }

    fn is_filler(word: u32) -> bool {
        word_type(word) == TYPE_NOT_VALID
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
            &McstCbltAddress {
                address: window.to_be_bytes()[0],
            },
        )?;
        bus.write_reg(base, &McstCbltCtrl { mode: role.into() })?;
        Self::set_bus_error(bus, handle, role.is_last())
    }

    fn disable_multiblock<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<()> {
        bus.write_reg(handle.register_base, &McstCbltCtrl::default())
    }

    fn reset_token<B: Bus>(_bus: &mut B, _handle: &BoardHandle) -> BusResult<()> {
        Ok(())
    }

    fn has_token<B: Bus>(_bus: &mut B, _handle: &BoardHandle) -> BusResult<Option<bool>> {
        Ok(None)
    }

    fn block_ready<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<bool> {
        let status: Status1 = bus.read_reg(handle.register_base)?;
        Ok(status.data_ready)
    }

    fn set_block_level<B: Bus>(bus: &mut B, handle: &BoardHandle, _level: u32) -> BusResult<()> {
        let mut ctrl: Control1 = bus.read_reg(handle.register_base)?;
        ctrl.block_end = true;
        bus.write_reg(handle.register_base, &ctrl)
    }

    fn clear<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<()> {
        let base = handle.register_base;
        bus.write_reg(
            base,
            &BitSet2 {
                clear_data: true,
                ..Default::default()
            },
        )?;
        bus.write_reg(
            base,
            &BitClear2 {
                clear_data: true,
                ..Default::default()
            },
        )
    }

    fn status<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<C775Status> {
        let base = handle.register_base;
        let rev: FirmwareRev = bus.read_reg(base)?;
        let status: Status1 = bus.read_reg(base)?;
        let ctrl: Control1 = bus.read_reg(base)?;
        let cblt: McstCbltCtrl = bus.read_reg(base)?;
        let low: EventCounterLow = bus.read_reg(base)?;
        let high: EventCounterHigh = bus.read_reg(base)?;
        Ok(C775Status {
            slot: handle.slot,
            firmware: rev.revision,
            data_ready: status.data_ready,
            busy: status.busy,
            bus_error_enabled: ctrl.bus_error_enable,
            cblt: cblt.mode,
            event_count: (u32::from(high.count) << 16) | u32::from(low.count),
        })
    }
}

impl Simulated for C775 {
    fn simulate(slot: SlotId, firmware: u32, base: u32, _a32: u32) -> SimBoard {
        let flag = |offset, mask| Flag {
            space: AddressSpace::A24,
            addr: base + offset,
            width: 2,
            mask,
        };
        let mut board = SimBoard::new(
            slot,
            base,
            0x10000,
            (AddressSpace::A24, base),
            flag(BitSet1::offset(), 1 << 3),
        );
        board.fifo_span = 0x800;
        board.bus_error_clear = Some(flag(BitClear1::offset(), 1 << 3));
        board.ready = Some(flag(Status1::offset(), 1 << 0));
        board.clear = Some(flag(BitSet2::offset(), 1 << 2));
        board.empty_word = Self::FILLER_WORD;
        board.presets = vec![
            (base + FirmwareRev::offset(), 2, firmware & 0xFFFF),
            (base + Geo::offset(), 2, u32::from(slot)),
            (base + BoardIdMid::offset(), 2, u32::from(BOARD_ID[1])),
            (base + BoardIdLsb::offset(), 2, u32::from(BOARD_ID[2])),
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

    fn event(slot: SlotId, channels: &[u32]) -> Vec<u32> {
        let geo = u32::from(slot) << 27;
        let mut words = vec![geo | (TYPE_HEADER << 24) | (u32::try_from(channels.len()).unwrap() << 8)];
        words.extend(channels.iter().map(|c| geo | (c << 16) | 0x0123));
        words.push(geo | (TYPE_END_OF_EVENT << 24) | 42);
        words
    }

    fn c775_crate(slots: &[SlotId]) -> (Mock, BoardRegistry<Mock, C775>) {
        let mock = Mock::new();
        for &slot in slots {
            mock.insert_board(C775::simulate(slot, 0x0A02, base(slot), 0));
        }
        let bases: Vec<_> = slots.iter().map(|s| base(*s)).collect();
        let registry = BoardRegistry::init(mock.clone(), &bases, options()).unwrap();
        (mock, registry)
    }

    #[test]
    fn test_word_types() {
        let words = event(6, &[0, 1]);
        assert!(!C775::is_block_trailer(words[0]));
        assert!(!C775::is_block_trailer(words[1]));
        assert!(C775::is_block_trailer(words[3]));
        assert!(C775::is_filler(C775::FILLER_WORD));
        assert!(!C775::is_filler(words[0]));
    }

    #[test]
    fn test_cblt_roles() {
        assert_eq!(CbltMode::from(ChainRole::First), CbltMode::First);
        assert_eq!(CbltMode::from(ChainRole::Sole), CbltMode::Last);
        let reg = McstCbltCtrl {
            mode: CbltMode::Middle,
        };
        assert_eq!(reg.serialize().unwrap(), [0, 3]);
    }

    #[test]
    fn test_control_bits() {
        let reg = Control1 {
            block_end: true,
            bus_error_enable: true,
            ..Default::default()
        };
        assert_eq!(u16::from_be_bytes(reg.serialize().unwrap()), 0x24);
    }

    #[test]
    fn test_probe() {
        let mut mock = Mock::new();
        mock.insert_board(C775::simulate(6, 0x0A02, base(6), 0));
        assert_eq!(
            C775::probe(&mut mock, base(6)).unwrap(),
            Some(Probe {
                slot: 6,
                firmware: 0x0A02
            })
        );
    }

    #[test]
    fn test_readout_acknowledges_bus_error() {
        let (mock, registry) = c775_crate(&[6]);
        let words = event(6, &[3, 4, 5]);
        mock.push_block(6, &words);
        assert!(registry.data_ready(6).unwrap());
        let mut buf = Aligned::default();
        let outcome = registry
            .read_block(6, &mut buf.0, 34, ReadMode::SingleBoardDma)
            .unwrap();
        assert_eq!(outcome.kind, OutcomeKind::TerminatedByBusError);
        assert_eq!(outcome.data(&buf.0), &words[..]);
        assert_eq!(mock.dma_log()[0].space, AddressSpace::A24);
        // The latched flag was cleared after the read
        let flag = mock.peek(AddressSpace::A24, base(6) + BitSet1::offset(), 2);
        assert_eq!(flag.unwrap() & (1 << 3), 0);
        assert!(!registry.data_ready(6).unwrap());
    }

    #[test]
    fn test_status() {
        let (mock, registry) = c775_crate(&[6]);
        mock.poke(AddressSpace::A24, base(6) + EventCounterLow::offset(), 2, 0x0010);
        mock.poke(AddressSpace::A24, base(6) + EventCounterHigh::offset(), 2, 0x0001);
        let status = registry.status(6).unwrap();
        assert_eq!(status.event_count, 0x1_0010);
        assert!(status.bus_error_enabled);
        assert_eq!(
            status.to_string(),
            "V775 slot 6 (firmware 0x0a02): 65552 events, empty, BERR, CBLT Disabled"
        );
    }
}
