//! The core types and functions shared by every board family

/// Geographic slot number of a board in a VME/VXS crate
pub type SlotId = u8;

/// The lowest slot a payload board can sit in (slot 0 doesn't exist)
pub const MIN_SLOT: SlotId = 1;
/// The highest slot of a 21 slot crate
pub const MAX_SLOT: SlotId = 21;

/// Is `slot` a real slot of the crate
#[must_use]
pub fn valid_slot(slot: SlotId) -> bool {
    (MIN_SLOT..=MAX_SLOT).contains(&slot)
}

/// The bit standing for `slot` in a slot mask
#[must_use]
pub fn slot_mask(slot: SlotId) -> u32 {
    1 << slot
}

/// The slots whose bits are set in `mask`, lowest first
pub fn slots_in_mask(mask: u32) -> impl Iterator<Item = SlotId> {
    (MIN_SLOT..=MAX_SLOT).filter(move |s| mask & slot_mask(*s) != 0)
}
