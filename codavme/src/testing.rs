//! Crates of simulated boards shared by the unit tests

use crate::{
    boards::{
        f1tdc::F1Tdc,
        jlab,
    },
    bus::mock::{
        Mock,
        Simulated,
    },
    core::SlotId,
    readout::classify::interpret_jvme,
    registry::{
        BoardRegistry,
        InitOptions,
    },
};

/// A24 base address of a board set to its geographic address
pub(crate) fn base(slot: SlotId) -> u32 {
    u32::from(slot) << 19
}

pub(crate) fn options() -> InitOptions {
    InitOptions::new(interpret_jvme)
}

/// A crate with an F1 TDC in each of `slots`
pub(crate) fn f1_crate(slots: &[SlotId]) -> (Mock, BoardRegistry<Mock, F1Tdc>) {
    let mock = Mock::new();
    let options = options();
    for &slot in slots {
        mock.insert_board(F1Tdc::simulate(slot, 0x0400, base(slot), options.a32_for(slot)));
    }
    let bases: Vec<_> = slots.iter().map(|s| base(*s)).collect();
    let registry = BoardRegistry::init(mock.clone(), &bases, options).unwrap();
    (mock, registry)
}

/// A JLab block of `n` data words, framed by its header and trailer
pub(crate) fn block(slot: SlotId, n: usize) -> Vec<u32> {
    let n = u32::try_from(n).unwrap();
    let mut words = vec![jlab::block_header(slot, 1, 1)];
    words.extend((0..n).map(|i| (u32::from(slot) << 16) | i));
    words.push(jlab::block_trailer(slot, n + 2));
    words
}

/// A destination buffer starting on an 8 byte boundary
#[repr(C, align(8))]
pub(crate) struct Aligned(pub [u32; 256]);

impl Default for Aligned {
    fn default() -> Self {
        Self([0; 256])
    }
}
