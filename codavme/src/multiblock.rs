//! Multiblock readout, where every board of a family shares one A32 window and a hardware token
//! decides which board is sourcing data at any moment.
//!
//! The lowest slot is the first board and the highest slot the last. Only the last board may end
//! the shared transaction, so it is the only one left with bus error termination. After a chain
//! has been drained the token sits on the last board, and it has to be handed back to the first
//! (with [`BoardRegistry::reset_chain_tokens`]) before the next trigger's data can come out.

use crate::{
    board::{
        BoardFamily,
        BoardHandle,
        ChainRole,
        TokenPath,
    },
    bus::Bus,
    core::{
        slot_mask,
        SlotId,
    },
    registry::{
        BoardRegistry,
        CrateState,
        Error,
        Result,
    },
};
use tracing::{
    debug,
    warn,
};

/// The boards taking part in multiblock readout and where they serve it
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MultiblockChain {
    /// A32 address of the shared window
    pub window: u32,
    pub token_path: TokenPath,
    pub first: SlotId,
    pub last: SlotId,
    /// Slot mask of every member
    pub members: u32,
}

impl<B, F> BoardRegistry<B, F>
where
    B: Bus,
    F: BoardFamily,
{
    /// Chain every board of the registry together, passing the token over `path`
    /// # Errors
    /// Returns an error if the family can't use `path` or on bus failures
    pub fn enable_multiblock(&self, path: TokenPath) -> Result<MultiblockChain> {
        if !F::TOKEN_PATHS.contains(&path) {
            return Err(Error::UnsupportedTokenPath {
                family: F::NAME,
                path,
            });
        }
        self.with_board_lock(|state| {
            let (Some(first), Some(last)) = (state.min_slot(), state.max_slot()) else {
                return Err(Error::NoBoards(F::NAME));
            };
            let window = state.options.multiblock_window;
            let handles: Vec<_> = state.handles().copied().collect();
            for (joined, handle) in handles.iter().enumerate() {
                let role = ChainRole::of(handle.slot, first, last);
                if let Err(e) = F::enable_multiblock(&mut state.bus, handle, role, window, path) {
                    // The failing board may be half programmed too
                    leave_chain::<B, F>(state, &handles[..=joined]);
                    state.chain = None;
                    return Err(e.into());
                }
                let stored = state.handle_mut(F::NAME, handle.slot)?;
                stored.role = Some(role);
                stored.bus_error_enabled = role.is_last();
                debug!("{} slot {} joins the chain as {role:?}", F::NAME, handle.slot);
            }
            let chain = MultiblockChain {
                window,
                token_path: path,
                first,
                last,
                members: state.scan_mask(),
            };
            state.chain = Some(chain);
            debug!(
                "{} multiblock enabled from slot {first} to slot {last} at {window:#010x}",
                F::NAME
            );
            Ok(chain)
        })
    }

    /// Take every board out of the chain, putting bus error termination back the way it was
    /// configured at init
    /// # Errors
    /// Returns an error on bus failures
    pub fn disable_multiblock(&self) -> Result<()> {
        self.with_board_lock(|state| {
            let preferred = state.options.bus_error;
            let handles: Vec<_> = state.handles().copied().collect();
            for handle in handles {
                F::disable_multiblock(&mut state.bus, &handle)?;
                F::set_bus_error(&mut state.bus, &handle, preferred)?;
                let stored = state.handle_mut(F::NAME, handle.slot)?;
                stored.role = None;
                stored.bus_error_enabled = preferred;
            }
            state.chain = None;
            debug!("{} multiblock disabled", F::NAME);
            Ok(())
        })
    }

    /// Send the token of the board in `slot` back to the first board of the chain
    /// # Errors
    /// Returns an error on bad slots or bus failures
    pub fn reset_token(&self, slot: SlotId) -> Result<()> {
        self.with_board_lock(|state| {
            let handle = state.handle(F::NAME, slot)?;
            Ok(F::reset_token(&mut state.bus, &handle)?)
        })
    }

    /// Reset the token on every board of the chain, the recovery after every multiblock read or
    /// whenever the token may be stuck
    /// # Errors
    /// Returns `MultiblockDisabled` outside of multiblock mode, or an error on bus failures
    pub fn reset_chain_tokens(&self) -> Result<()> {
        self.with_board_lock(|state| {
            let chain = state.chain.ok_or(Error::MultiblockDisabled)?;
            let members: Vec<_> = state
                .handles()
                .filter(|h| chain.members & slot_mask(h.slot) != 0)
                .copied()
                .collect();
            for handle in &members {
                F::reset_token(&mut state.bus, handle)?;
            }
            Ok(())
        })
    }

    /// The slots whose boards report holding the token. Anything other than the first board
    /// between reads means the token is stuck there. Families that can't report the token
    /// never show up.
    /// # Errors
    /// Returns an error on bus failures
    pub fn token_holders(&self) -> Result<Vec<SlotId>> {
        self.with_board_lock(|state| {
            let handles: Vec<_> = state.handles().copied().collect();
            let mut holders = vec![];
            for handle in &handles {
                if F::has_token(&mut state.bus, handle)? == Some(true) {
                    holders.push(handle.slot);
                }
            }
            if let Some(chain) = state.chain {
                for slot in holders.iter().filter(|s| **s != chain.first) {
                    warn!("{} token stuck in slot {slot}", F::NAME);
                }
            }
            Ok(holders)
        })
    }

    /// The active chain, if multiblock readout is enabled
    #[must_use]
    pub fn chain(&self) -> Option<MultiblockChain> {
        self.with_board_lock(|state| state.chain)
    }
}

/// Take the boards of a chain that never came up back out of it, with bus error termination
/// put back the way it was before
fn leave_chain<B: Bus, F: BoardFamily>(state: &mut CrateState<B>, before: &[BoardHandle]) {
    for handle in before {
        let restored = F::disable_multiblock(&mut state.bus, handle)
            .and_then(|()| F::set_bus_error(&mut state.bus, handle, handle.bus_error_enabled));
        if let Err(e) = restored {
            warn!("{} slot {} didn't leave the chain - {e}", F::NAME, handle.slot);
        }
        if let Ok(stored) = state.handle_mut(F::NAME, handle.slot) {
            stored.role = None;
            stored.bus_error_enabled = handle.bus_error_enabled;
        }
    }
}
