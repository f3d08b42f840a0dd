//! # CODA Utilities
//!
//! This small library contains utility functions for the text configuration files used to set up
//! the boards of a CODA readout crate.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod crate_config;
