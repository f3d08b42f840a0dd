//! Applying the settings of a crate configuration file to a family of boards

use crate::{
    board::{
        BoardFamily,
        TokenPath,
    },
    bus::Bus,
    registry::{
        BoardRegistry,
        Error,
        Result,
    },
};
use coda_utils::crate_config::CrateSection;
use std::str::FromStr;
use tracing::debug;

fn config_error<F: BoardFamily>(key: &str, values: &[String]) -> Error {
    Error::Config {
        key: format!("{}_{key}", F::CONFIG_PREFIX),
        value: values.join(" "),
    }
}

/// The single value of a setting, parsed
fn single<F: BoardFamily, T: FromStr>(key: &str, values: &[String]) -> Result<T> {
    match values {
        [value] => value.parse().map_err(|_| config_error::<F>(key, values)),
        _ => Err(config_error::<F>(key, values)),
    }
}

fn switch<F: BoardFamily>(key: &str, values: &[String]) -> Result<bool> {
    match values {
        [value] => match value.to_ascii_lowercase().as_str() {
            "1" | "on" => Ok(true),
            "0" | "off" => Ok(false),
            _ => Err(config_error::<F>(key, values)),
        },
        _ => Err(config_error::<F>(key, values)),
    }
}

/// `None` turns multiblock readout off
fn token_path<F: BoardFamily>(values: &[String]) -> Result<Option<TokenPath>> {
    match values {
        [value] => match value.to_ascii_lowercase().as_str() {
            "off" | "0" => Ok(None),
            "p0" => Ok(Some(TokenPath::P0)),
            "p2" => Ok(Some(TokenPath::P2)),
            "daisy" => Ok(Some(TokenPath::Daisy)),
            _ => Err(config_error::<F>("MULTIBLOCK", values)),
        },
        _ => Err(config_error::<F>("MULTIBLOCK", values)),
    }
}

impl<B, F> BoardRegistry<B, F>
where
    B: Bus,
    F: BoardFamily,
{
    /// Apply the `<PREFIX>_BLOCK_LEVEL`, `<PREFIX>_MULTIBLOCK` and `<PREFIX>_BERR` settings of a
    /// crate section to the boards of this family.
    ///
    /// Block levels and bus error termination are per slot, multiblock readout is crate wide.
    /// While a chain is active its roles decide bus error termination, so `BERR` lines are
    /// ignored.
    /// # Errors
    /// Returns `Config` on values that don't parse, or any error the individual settings return
    pub fn configure(&self, section: &CrateSection) -> Result<()> {
        let prefix = F::CONFIG_PREFIX;
        let slots = self.slots();
        for &slot in &slots {
            if let Some(values) = section.lookup(prefix, "BLOCK_LEVEL", slot) {
                let level = single::<F, u32>("BLOCK_LEVEL", values)?;
                self.set_block_level(slot, level)?;
            }
        }
        if let Some(values) = section.lookup_global(prefix, "MULTIBLOCK") {
            match token_path::<F>(values)? {
                Some(path) => {
                    self.enable_multiblock(path)?;
                }
                None if self.chain().is_some() => self.disable_multiblock()?,
                None => {}
            }
        }
        if self.chain().is_none() {
            for &slot in &slots {
                if let Some(values) = section.lookup(prefix, "BERR", slot) {
                    self.set_bus_error(slot, switch::<F>("BERR", values)?)?;
                }
            }
        }
        debug!("Configured {} {} boards", slots.len(), F::NAME);
        Ok(())
    }
}
