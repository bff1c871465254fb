use color_eyre::eyre::Result;
use engine::{multi_threaded, Engine};
use mimalloc_rust::GlobalMiMalloc;
use task::labels::ProcessLabels;

use crate::{exporter::DemoExporterFactory, processor::DemoProcessorFactory, receiver::DemoReceiverFactory};

mod common;
mod exporter;
mod processor;
mod receiver;

// Recommended global allocator to get the best performance out of the
// pipeline engine.
#[global_allocator]
static GLOBAL_MIMALLOC: GlobalMiMalloc = GlobalMiMalloc;

fn main() -> Result<()> {
    common::init()?;

    let mut engine = multi_threaded::Engine::new(
        DemoReceiverFactory::default(),
        DemoProcessorFactory::default(),
        DemoExporterFactory::default(),
    );
    engine.run(ProcessLabels::new("df-engine-demo"), "demos/multithread_config.yaml")?;

    Ok(())
}
