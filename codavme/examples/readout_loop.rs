//! In this example, we will bring up a crate of simulated F1 TDCs, apply a crate configuration,
//! and drain a multiblock chain from a readout thread until every trigger has been read.

use codavme::{
    bus::mock::{
        Mock,
        Simulated,
    },
    boards::jlab,
    prelude::*,
};
use coda_utils::crate_config::parse_crate_config;
use crossbeam_channel::unbounded;
use std::time::Duration;
use tracing::info;

const CONFIG: &str = "
CRATE roc1
F1_SLOT all
F1_BLOCK_LEVEL 1
F1_MULTIBLOCK p0
CRATE end
";

const SLOTS: [u8; 3] = [3, 4, 5];
const TRIGGERS: u32 = 4;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let mock = Mock::new();
    let options = InitOptions::new(interpret_jvme);
    for slot in SLOTS {
        let base = u32::from(slot) << 19;
        mock.insert_board(F1Tdc::simulate(slot, 0x0400, base, options.a32_for(slot)));
    }
    let bases: Vec<_> = SLOTS.iter().map(|s| u32::from(*s) << 19).collect();
    let registry: BoardRegistry<_, F1Tdc> = BoardRegistry::init(mock.clone(), &bases, options)?;

    let config = parse_crate_config(CONFIG)?;
    let section = config
        .section("roc1")
        .ok_or_else(|| anyhow::anyhow!("No roc1 in the configuration"))?;
    registry.configure(section)?;
    let chain = registry
        .chain()
        .ok_or_else(|| anyhow::anyhow!("The configuration didn't enable multiblock"))?;
    // Real hardware wires this up on its own
    mock.set_chain(chain.window, &SLOTS);

    let (tx, rx) = unbounded();
    let poller = Poller::spawn(
        registry.clone(),
        PollerConfig {
            slot: chain.first,
            mode: ReadMode::MultiboardDma,
            max_words: 1024,
            interval: Duration::from_millis(1),
        },
        move |block| {
            let _ = tx.send(block);
        },
    )?;

    for trigger in 1..=TRIGGERS {
        for slot in SLOTS {
            let hits = (0..trigger).map(|i| (u32::from(slot) << 16) | i);
            let mut words = vec![
                jlab::block_header(slot, trigger, 1),
                jlab::event_header(slot, trigger),
            ];
            words.extend(hits);
            words.push(jlab::block_trailer(slot, trigger + 3));
            mock.push_block(slot, &words);
        }
        let block = rx.recv_timeout(Duration::from_secs(1))?;
        info!(
            "Trigger {trigger}: {:?} with {} words",
            block.outcome.kind,
            block.words.len()
        );
    }
    poller.stop();

    for (_, status) in registry.gstatus()? {
        info!("{status}");
    }
    Ok(())
}
