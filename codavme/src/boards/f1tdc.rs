//! Routines for the JLab F1 TDC (v2, VXS).
//!
//! The board keeps its registers in A24 at its geographic address and serves its event FIFO
//! from an A32 window we assign. Multiblock tokens can be routed over either P0 or P2.

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
use tracing::trace;

const BOARD_TYPE: u16 = 0xF1DC;

#[offset(0x0)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct Version {
    #[packed_field(bits = "16..=31")]
    pub board_type: u16,
    #[packed_field(bits = "0..=15")]
    pub firmware: u16,
}

/// Control/status register. Reads report status, writes issue the commands.
#[offset(0x4)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct Csr {
    #[packed_field(bits = "0")]
    pub block_ready: bool,
    #[packed_field(bits = "2")]
    pub bus_error: bool,
    #[packed_field(bits = "4")]
    pub token: bool,
    #[packed_field(bits = "28")]
    pub token_return: bool,
    #[packed_field(bits = "30")]
    pub clear: bool,
    #[packed_field(bits = "31")]
    pub soft_reset: bool,
}

#[offset(0x8)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct Ctrl {
    #[packed_field(bits = "20")]
    pub bus_error_enable: bool,
    #[packed_field(bits = "21")]
    pub multiblock: bool,
    #[packed_field(bits = "22")]
    pub first_board: bool,
    #[packed_field(bits = "23")]
    pub last_board: bool,
    #[packed_field(bits = "24")]
    pub token_p0: bool,
    #[packed_field(bits = "25")]
    pub token_p2: bool,
}

#[offset(0xC)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct EventCount {
    #[packed_field(bits = "0..=31")]
    pub count: u32,
}

#[offset(0x10)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct BlockLevel {
    #[packed_field(bits = "0..=15")]
    pub level: u16,
}

#[offset(0x14)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct Geo {
    #[packed_field(bits = "0..=4")]
    pub slot: Integer<u8, packed_bits::Bits<5>>,
}

/// A32 address of the board's own FIFO window, in units of 64 kB
#[offset(0x18)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct Adr32 {
    #[packed_field(bits = "16..=31")]
    pub base: u16,
    #[packed_field(bits = "0")]
    pub enable: bool,
}

/// A32 address of the shared multiblock window, in units of 64 kB
#[offset(0x1C)]
#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct AdrMb {
    #[packed_field(bits = "16..=31")]
    pub window: u16,
    #[packed_field(bits = "0")]
    pub enable: bool,
}

/// A32 addresses live in the upper half of their registers
#[allow(clippy::cast_possible_truncation)]
fn a32_page(addr: u32) -> u16 {
    (addr >> 16) as u16
}

/// Snapshot of an F1 TDC's status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct F1Status {
    pub slot: SlotId,
    pub firmware: u16,
    pub block_ready: bool,
    pub bus_error_enabled: bool,
    pub multiblock: bool,
    pub first_board: bool,
    pub last_board: bool,
    pub token: bool,
    pub block_level: u16,
    pub event_count: u32,
}

impl fmt::Display for F1Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "F1TDC slot {}: firmware {:#06x}, block level {}, {} events, {}{}",
            self.slot,
            self.firmware,
            self.block_level,
            self.event_count,
            if self.block_ready { "ready" } else { "idle" },
            if self.bus_error_enabled { ", BERR" } else { "" },
        )?;
        if self.multiblock {
            let role = match (self.first_board, self.last_board) {
                (true, true) => "sole",
                (true, false) => "first",
                (false, true) => "last",
                (false, false) => "middle",
            };
            write!(
                f,
                ", multiblock {role}{}",
                if self.token { " (token)" } else { "" }
            )?;
        }
        Ok(())
    }
}

/// The JLab F1 TDC
#[derive(Debug, Copy, Clone)]
pub struct F1Tdc;

impl BoardFamily for F1Tdc {
    const NAME: &'static str = "F1TDC";
    const CONFIG_PREFIX: &'static str = "F1";
    const MIN_FIRMWARE: u32 = 0x0200;
    const FILLER_WORD: u32 = 0xF800_FAFA;
    const MAX_BLOCK_LEVEL: u32 = 0xFFFF;
    const TOKEN_PATHS: &'static [TokenPath] = &[TokenPath::P0, TokenPath::P2];

    type Status = F1Status;

    fn probe<B: Bus>(bus: &mut B, base: u32) -> BusResult<Option<Probe>> {
        let version: Version = bus.read_reg(base)?;
        if version.board_type != BOARD_TYPE {
            return Ok(None);
        }
        let geo: Geo = bus.read_reg(base)?;
        Ok(Some(Probe {
            slot: *geo.slot,
            firmware: u32::from(version.firmware),
        }))
    }

    fn fifo(_base: u32, a32: u32) -> (AddressSpace, u32) {
        (AddressSpace::A32, a32)
    }

    fn initialize<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<()> {
        let base = handle.register_base;
        bus.write_reg(
            base,
            &Csr {
                soft_reset: true,
                ..Default::default()
            },
        )?;
        bus.write_reg(
            base,
            &Adr32 {
                base: a32_page(handle.fifo.1),
                enable: true,
            },
        )?;
        Self::set_block_level(bus, handle, handle.block_level)?;
        bus.write_reg(
            base,
            &Ctrl {
                bus_error_enable: handle.bus_error_enabled,
                ..Default::default()
            },
        )?;
        trace!("F1TDC slot {} initialized", handle.slot);
        Ok(())
    }

    fn set_bus_error<B: Bus>(bus: &mut B, handle: &BoardHandle, enable: bool) -> BusResult<()> {
        let mut ctrl: Ctrl = bus.read_reg(handle.register_base)?;
        ctrl.bus_error_enable = enable;
        bus.write_reg(handle.register_base, &ctrl)
    }

    fn bus_error_status<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<bool> {
        let csr: Csr = bus.read_reg(handle.register_base)?;
        Ok(csr.bus_error)
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
        path: TokenPath,
    ) -> BusResult<()> {
        let base = handle.register_base;
        bus.write_reg(
            base,
            &AdrMb {
                window: a32_page(window),
                enable: true,
            },
        )?;
        let mut ctrl: Ctrl = bus.read_reg(base)?;
        ctrl.multiblock = true;
        ctrl.first_board = role.is_first();
        ctrl.last_board = role.is_last();
        ctrl.token_p0 = path == TokenPath::P0;
        ctrl.token_p2 = path == TokenPath::P2;
        ctrl.bus_error_enable = role.is_last();
        bus.write_reg(base, &ctrl)
    }

    fn disable_multiblock<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<()> {
        let base = handle.register_base;
        let mut ctrl: Ctrl = bus.read_reg(base)?;
        ctrl.multiblock = false;
        ctrl.first_board = false;
        ctrl.last_board = false;
        ctrl.token_p0 = false;
        ctrl.token_p2 = false;
        bus.write_reg(base, &ctrl)?;
        bus.write_reg(base, &AdrMb::default())
    }

    fn reset_token<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<()> {
        bus.write_reg(
            handle.register_base,
            &Csr {
                token_return: true,
                ..Default::default()
            },
        )
    }

    fn has_token<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<Option<bool>> {
        let csr: Csr = bus.read_reg(handle.register_base)?;
        Ok(Some(csr.token))
    }

    fn block_ready<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<bool> {
        let csr: Csr = bus.read_reg(handle.register_base)?;
        Ok(csr.block_ready)
    }

    fn set_block_level<B: Bus>(bus: &mut B, handle: &BoardHandle, level: u32) -> BusResult<()> {
        bus.write_reg(
            handle.register_base,
            &BlockLevel {
                level: u16::try_from(level).unwrap_or(u16::MAX),
            },
        )
    }

    fn clear<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<()> {
        bus.write_reg(
            handle.register_base,
            &Csr {
                clear: true,
                ..Default::default()
            },
        )
    }

    fn status<B: Bus>(bus: &mut B, handle: &BoardHandle) -> BusResult<F1Status> {
        let base = handle.register_base;
        let version: Version = bus.read_reg(base)?;
        let csr: Csr = bus.read_reg(base)?;
        let ctrl: Ctrl = bus.read_reg(base)?;
        let level: BlockLevel = bus.read_reg(base)?;
        let events: EventCount = bus.read_reg(base)?;
        Ok(F1Status {
            slot: handle.slot,
            firmware: version.firmware,
            block_ready: csr.block_ready,
            bus_error_enabled: ctrl.bus_error_enable,
            multiblock: ctrl.multiblock,
            first_board: ctrl.first_board,
            last_board: ctrl.last_board,
            token: csr.token,
            block_level: level.level,
            event_count: events.count,
        })
    }
}

impl Simulated for F1Tdc {
    fn simulate(slot: SlotId, firmware: u32, base: u32, a32: u32) -> SimBoard {
        let csr = |mask| Flag {
            space: AddressSpace::A24,
            addr: base + Csr::offset(),
            width: 4,
            mask,
        };
        let mut board = SimBoard::new(slot, base, 0x100, (AddressSpace::A32, a32), csr(1 << 2));
        board.fifo_span = 0x1000;
        board.ready = Some(csr(1 << 0));
        board.token = Some(csr(1 << 4));
        board.token_return = Some(csr(1 << 28));
        board.clear = Some(csr(1 << 30));
        board.empty_word = Self::FILLER_WORD;
        board.presets = vec![
            (
                base + Version::offset(),
                4,
                (u32::from(BOARD_TYPE) << 16) | (firmware & 0xFFFF),
            ),
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
        testing::base,
    };
    use paste::paste;

    macro_rules! test_register_bits {
        ($reg:ident, $field:ident, $bits:expr) => {
            paste! {
                #[test]
                fn [<test_ $reg:snake _ $field>]() {
                    let reg = $reg {
                        $field: true,
                        ..Default::default()
                    };
                    assert_eq!(u32::from_be_bytes(reg.serialize().unwrap()), $bits);
                }
            }
        };
    }

    test_register_bits!(Csr, block_ready, 1 << 0);
    test_register_bits!(Csr, bus_error, 1 << 2);
    test_register_bits!(Csr, token, 1 << 4);
    test_register_bits!(Csr, token_return, 1 << 28);
    test_register_bits!(Csr, clear, 1 << 30);
    test_register_bits!(Csr, soft_reset, 1 << 31);
    test_register_bits!(Ctrl, bus_error_enable, 1 << 20);
    test_register_bits!(Ctrl, multiblock, 1 << 21);
    test_register_bits!(Ctrl, first_board, 1 << 22);
    test_register_bits!(Ctrl, last_board, 1 << 23);
    test_register_bits!(Ctrl, token_p0, 1 << 24);
    test_register_bits!(Ctrl, token_p2, 1 << 25);

    #[test]
    fn test_version() {
        let version = Version::deserialize([0xF1, 0xDC, 0x03, 0x02]).unwrap();
        assert_eq!(version.board_type, BOARD_TYPE);
        assert_eq!(version.firmware, 0x0302);
    }

    #[test]
    fn test_adr32() {
        let reg = Adr32 {
            base: a32_page(0x0828_0000),
            enable: true,
        };
        assert_eq!(reg.serialize().unwrap(), [0x08, 0x28, 0x00, 0x01]);
    }

    #[test]
    fn test_probe() {
        let mut mock = Mock::new();
        mock.insert_board(F1Tdc::simulate(9, 0x0302, base(9), 0x0848_0000));
        let probe = F1Tdc::probe(&mut mock, base(9)).unwrap();
        assert_eq!(
            probe,
            Some(Probe {
                slot: 9,
                firmware: 0x0302
            })
        );
        // Something that isn't an F1
        mock.map(AddressSpace::A24, base(10), 0x100);
        assert_eq!(F1Tdc::probe(&mut mock, base(10)).unwrap(), None);
    }

    #[test]
    fn test_status_display() {
        let status = F1Status {
            slot: 9,
            firmware: 0x0302,
            block_ready: true,
            bus_error_enabled: false,
            multiblock: true,
            first_board: false,
            last_board: true,
            token: true,
            block_level: 1,
            event_count: 17,
        };
        assert_eq!(
            status.to_string(),
            "F1TDC slot 9: firmware 0x0302, block level 1, 17 events, ready, multiblock last (token)"
        );
    }
}
