//! # codavme
//!
//! Block readout for the boards of a CODA VME/VXS crate: single-cycle reads, DMA out of a single
//! board's FIFO, and multiblock DMA draining a whole token chain of boards in one transaction.
//! Every transfer comes back as a [`readout::classify::TransferOutcome`] telling how it ended.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod board;
pub mod boards;
pub mod bus;
pub mod config;
pub mod core;
pub mod lock;
pub mod multiblock;
pub mod prelude;
pub mod readout;
pub mod registry;

#[cfg(test)]
mod testing;

pub use registry::Error;
