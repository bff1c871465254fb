//! Hot reload (§4.8): reconfiguration swaps the whole pipeline graph
//! atomically rather than patching individual nodes, matching the
//! coarse SIGHUP-triggered reload granularity of the original control
//! server. A reload stops every pipeline the controller currently owns,
//! re-resolves the configuration file, and brings up a fresh set of
//! pipelines under the same controller and singleton registry.

use std::path::Path;
use std::sync::Arc;

use config::Config;
use exporter::ExporterFactory;
use processor::ProcessorFactory;
use receiver::ReceiverFactory;

use crate::{controllers::EngineController, create_pipelines, singleton::SingletonManager, Error, PipelineContext};

/// Stops the pipelines owned by `controller`, reloads `config_file_path`,
/// and spawns a fresh `create_pipelines` run. Returns once the new
/// pipelines have been created, not once they finish running; their
/// tasks are tracked by their own task manager, independent from the
/// caller's.
pub(crate) async fn reload<Msg, Rec, Proc, Exp, P>(
    config_file_path: P,
    receiver_factory: Arc<Rec>,
    processor_factory: Arc<Proc>,
    exporter_factory: Arc<Exp>,
    pipeline_context: PipelineContext,
    controller: EngineController,
) -> Result<(), Error>
where
    Rec: ReceiverFactory<Msg> + 'static + Send + Sync,
    Proc: ProcessorFactory<Msg> + 'static + Send + Sync,
    Exp: ExporterFactory<Msg> + 'static + Send + Sync,
    Msg: 'static + Clone + Send,
    P: AsRef<Path> + Clone + Send + 'static,
{
    tracing::info!("reload requested, stopping current pipelines");
    controller.stop_all()?;

    let config = Config::load_with_factories(config_file_path, receiver_factory, processor_factory, exporter_factory)?;

    let _ = tokio::task::spawn(create_pipelines::<Msg>(
        pipeline_context,
        None,
        config,
        controller,
        SingletonManager::default(),
    ));

    tracing::info!("reload complete, new pipelines starting");
    Ok(())
}
