//! Prelude (helpful reexports) for this package

pub use crate::{
    board::{
        BoardFamily,
        TokenPath,
    },
    boards::{
        c775::C775,
        f1tdc::F1Tdc,
        ssp::Ssp,
    },
    bus::Bus,
    multiblock::MultiblockChain,
    readout::{
        classify::{
            interpret_jvme,
            interpret_vxworks,
            OutcomeKind,
            TransferOutcome,
        },
        poller::{
            Poller,
            PollerConfig,
        },
        ReadMode,
    },
    registry::{
        BoardRegistry,
        InitOptions,
    },
};
pub use coda_utils::crate_config::read_crate_config;
