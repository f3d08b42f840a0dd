//! Turning what the DMA engine and the board said about a transfer into one small vocabulary

use crate::bus::{
    DmaWait,
    Platform,
};
use tracing::error;

/// How a block readout ended
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    /// Programmed I/O saw the block trailer
    Complete,
    /// The requested word count ran out before the board finished; part of an event may still be
    /// sitting in the FIFO
    TerminatedByWordCount,
    /// The board ended the block itself by raising a bus error after its last word
    TerminatedByBusError,
    /// The DMA engine never finished within the timeout
    TerminatedByTimeout,
    /// The driver reported a count of zero. What that means depends on the platform, so it is
    /// left for the caller to decide.
    ZeroWordCount,
    /// The DMA engine refused to start or reported a failure
    DmaEngineError,
}

impl OutcomeKind {
    /// Did the board mark the end of the data itself
    #[must_use]
    pub fn is_valid_block(self) -> bool {
        matches!(
            self,
            OutcomeKind::Complete | OutcomeKind::TerminatedByBusError
        )
    }
}

/// The result of one block readout
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Words written to the caller's buffer, including the alignment filler. Zero whenever the
    /// buffer contents are not to be trusted (timeouts, engine errors, zero counts).
    pub words_transferred: usize,
    pub kind: OutcomeKind,
    /// Whether the buffer starts with an alignment filler word
    pub leading_filler: bool,
}

impl TransferOutcome {
    #[must_use]
    pub fn is_valid_block(&self) -> bool {
        self.kind.is_valid_block()
    }

    /// Whether the board should be cleared before the next readout because data of a partly read
    /// event may be left in it
    #[must_use]
    pub fn needs_flush(&self) -> bool {
        self.kind == OutcomeKind::TerminatedByWordCount
    }

    /// The data words, leaving out the alignment filler
    #[must_use]
    pub fn data<'a>(&self, buf: &'a [u32]) -> &'a [u32] {
        let start = usize::from(self.leading_filler).min(self.words_transferred);
        buf.get(start..self.words_transferred).unwrap_or_default()
    }
}

/// What a platform's raw DMA wait result means, once interpreted
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum WaitReading {
    /// This many bytes made it into memory
    Transferred(usize),
    /// The driver said zero
    Zero,
    /// The driver returned its failure sentinel
    EngineError,
    /// Waiting gave up
    TimedOut,
}

/// Interprets a raw DMA wait result given the number of bytes that were requested.
///
/// The VME drivers disagree on what the number they return counts, so the integration picks the
/// function matching its driver.
pub type WaitInterpreter = fn(&DmaWait, usize) -> WaitReading;

fn wrong_platform(wait: &DmaWait, expected: Platform) -> WaitReading {
    error!(
        "Got a DMA wait result from a {:?} driver while interpreting for {expected:?}",
        wait.platform
    );
    WaitReading::EngineError
}

/// Interpreter for the Linux `jvme` driver, which returns the number of bytes transferred
#[must_use]
pub fn interpret_jvme(wait: &DmaWait, requested: usize) -> WaitReading {
    if wait.platform != Platform::Linux {
        return wrong_platform(wait, Platform::Linux);
    }
    match usize::try_from(wait.raw) {
        Err(_) => WaitReading::EngineError,
        Ok(0) => WaitReading::Zero,
        Ok(n) if n > requested => {
            error!("The DMA engine claims {n} bytes moved but only {requested} were requested");
            WaitReading::EngineError
        }
        Ok(n) => WaitReading::Transferred(n),
    }
}

/// Interpreter for the VxWorks `sysVmeDmaDone` driver, which returns the number of bytes left
/// when the transfer was cut short by a bus error and zero when the full count went through.
/// Nothing left over out of nothing moved is a zero count, not a transfer.
#[must_use]
pub fn interpret_vxworks(wait: &DmaWait, requested: usize) -> WaitReading {
    if wait.platform != Platform::VxWorks {
        return wrong_platform(wait, Platform::VxWorks);
    }
    match usize::try_from(wait.raw) {
        Err(_) => WaitReading::EngineError,
        Ok(0) => WaitReading::Zero,
        Ok(remaining) if remaining > requested => {
            error!("The DMA engine claims {remaining} bytes left of only {requested} requested");
            WaitReading::EngineError
        }
        Ok(remaining) if remaining == requested => WaitReading::Zero,
        Ok(remaining) => WaitReading::Transferred(requested - remaining),
    }
}

/// Decide how a DMA block transfer ended from the interpreted wait result and the board's bus
/// error status bit. A board raises its bus error on an empty FIFO too, so a transfer of nothing
/// is a zero count whatever the status says.
#[must_use]
pub fn classify(reading: WaitReading, bus_error_status: bool) -> OutcomeKind {
    match reading {
        WaitReading::TimedOut => OutcomeKind::TerminatedByTimeout,
        WaitReading::EngineError => OutcomeKind::DmaEngineError,
        WaitReading::Zero | WaitReading::Transferred(0) => OutcomeKind::ZeroWordCount,
        WaitReading::Transferred(_) if bus_error_status => OutcomeKind::TerminatedByBusError,
        WaitReading::Transferred(_) => OutcomeKind::TerminatedByWordCount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn linux(raw: i32) -> DmaWait {
        DmaWait {
            platform: Platform::Linux,
            raw,
        }
    }

    fn vxworks(raw: i32) -> DmaWait {
        DmaWait {
            platform: Platform::VxWorks,
            raw,
        }
    }

    #[test]
    fn test_jvme() {
        assert_eq!(interpret_jvme(&linux(168), 400), WaitReading::Transferred(168));
        assert_eq!(interpret_jvme(&linux(0), 400), WaitReading::Zero);
        assert_eq!(interpret_jvme(&linux(-1), 400), WaitReading::EngineError);
        assert_eq!(interpret_jvme(&linux(404), 400), WaitReading::EngineError);
        assert_eq!(interpret_jvme(&vxworks(168), 400), WaitReading::EngineError);
    }

    #[test]
    fn test_vxworks() {
        assert_eq!(
            interpret_vxworks(&vxworks(232), 400),
            WaitReading::Transferred(168)
        );
        assert_eq!(interpret_vxworks(&vxworks(0), 400), WaitReading::Zero);
        // Everything left over, nothing moved
        assert_eq!(interpret_vxworks(&vxworks(400), 400), WaitReading::Zero);
        assert_eq!(interpret_vxworks(&vxworks(-1), 400), WaitReading::EngineError);
        assert_eq!(interpret_vxworks(&vxworks(800), 400), WaitReading::EngineError);
        assert_eq!(interpret_vxworks(&linux(232), 400), WaitReading::EngineError);
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(WaitReading::Transferred(168), true),
            OutcomeKind::TerminatedByBusError
        );
        assert_eq!(
            classify(WaitReading::Transferred(400), false),
            OutcomeKind::TerminatedByWordCount
        );
        assert_eq!(classify(WaitReading::Zero, true), OutcomeKind::ZeroWordCount);
        assert_eq!(
            classify(WaitReading::Transferred(0), true),
            OutcomeKind::ZeroWordCount
        );
        assert_eq!(
            classify(WaitReading::TimedOut, false),
            OutcomeKind::TerminatedByTimeout
        );
    }

    #[test]
    fn test_outcome_data() {
        let buf = [0xF800_FAFA, 1, 2, 3];
        let outcome = TransferOutcome {
            words_transferred: 4,
            kind: OutcomeKind::TerminatedByBusError,
            leading_filler: true,
        };
        assert_eq!(outcome.data(&buf), [1, 2, 3]);
        let outcome = TransferOutcome {
            words_transferred: 0,
            kind: OutcomeKind::DmaEngineError,
            leading_filler: true,
        };
        assert!(outcome.data(&buf).is_empty());
        assert!(!outcome.is_valid_block());
    }

    fn readings() -> impl Strategy<Value = WaitReading> {
        prop_oneof![
            any::<usize>().prop_map(WaitReading::Transferred),
            Just(WaitReading::Zero),
            Just(WaitReading::EngineError),
            Just(WaitReading::TimedOut),
        ]
    }

    proptest! {
        #[test]
        fn classify_is_total(reading in readings(), berr in any::<bool>()) {
            let kind = classify(reading, berr);
            // Programmed I/O is the only way to a complete block
            prop_assert_ne!(kind, OutcomeKind::Complete);
            // A valid block only ever comes out of data that actually moved
            if kind.is_valid_block() {
                prop_assert!(matches!(reading, WaitReading::Transferred(n) if n > 0) && berr);
            }
        }

        #[test]
        fn interpreters_never_overcount(raw in any::<i32>(), requested in 0usize..0x10_0000) {
            for reading in [
                interpret_jvme(&linux(raw), requested),
                interpret_vxworks(&vxworks(raw), requested),
            ] {
                if let WaitReading::Transferred(n) = reading {
                    prop_assert!(n <= requested);
                }
            }
        }
    }
}
