use color_eyre::eyre::Result;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Shared bring-up for the demo binaries: color-eyre panic reports and a
/// plain `tracing` subscriber at `INFO`.
pub fn init() -> Result<()> {
    color_eyre::install()?;

    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    Ok(())
}
