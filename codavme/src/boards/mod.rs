//! The supported board families

pub mod c775;
pub mod f1tdc;
pub mod ssp;

/// The JLab data format shared by the VXS boards.
///
/// Bit 31 marks a data type defining word, which carries its type in bits 27..=30 and the slot
/// of the board that produced it in bits 22..=26. Words with bit 31 clear continue the last
/// defined type.
pub mod jlab {
    use crate::core::SlotId;

    pub const BLOCK_HEADER: u32 = 0;
    pub const BLOCK_TRAILER: u32 = 1;
    pub const EVENT_HEADER: u32 = 2;
    pub const FILLER: u32 = 15;

    /// The type of a data type defining word
    #[must_use]
    pub fn word_type(word: u32) -> Option<u32> {
        (word & 0x8000_0000 != 0).then_some((word >> 27) & 0xF)
    }

    #[must_use]
    pub fn is_block_trailer(word: u32) -> bool {
        word_type(word) == Some(BLOCK_TRAILER)
    }

    #[must_use]
    pub fn is_filler(word: u32) -> bool {
        word_type(word) == Some(FILLER)
    }

    fn defining(kind: u32, slot: SlotId) -> u32 {
        0x8000_0000 | (kind << 27) | (u32::from(slot & 0x1F) << 22)
    }

    /// Block header for block `number` holding `events` events
    #[must_use]
    pub fn block_header(slot: SlotId, number: u32, events: u32) -> u32 {
        defining(BLOCK_HEADER, slot) | ((number & 0x3FF) << 8) | (events & 0xFF)
    }

    /// Block trailer closing a block of `words` words (header and trailer included)
    #[must_use]
    pub fn block_trailer(slot: SlotId, words: u32) -> u32 {
        defining(BLOCK_TRAILER, slot) | (words & 0x3F_FFFF)
    }

    #[must_use]
    pub fn event_header(slot: SlotId, number: u32) -> u32 {
        defining(EVENT_HEADER, slot) | (number & 0x3F_FFFF)
    }

    #[must_use]
    pub fn filler(slot: SlotId) -> u32 {
        defining(FILLER, slot)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_words() {
            assert_eq!(block_trailer(4, 42), 0x8900_002A);
            assert!(is_block_trailer(block_trailer(21, 3)));
            assert!(!is_block_trailer(block_header(4, 1, 1)));
            assert!(!is_block_trailer(0x0900_002A));
            assert!(is_filler(filler(7)));
            assert!(is_filler(0xF800_FAFA));
            assert_eq!(word_type(event_header(3, 9)), Some(EVENT_HEADER));
            assert_eq!(word_type(0x1234), None);
        }
    }
}
