use event::Event;
use exporter::destination_worker::{DestinationWorker, DestinationWorkerConfig, StdoutSink};
use exporter::{AsyncExporter, ConcurrencyModel, Error, ExporterBuilder, ExporterFactory};
use serde_yaml::Value;

struct DemoExporterBuilder {
    name: String,
}

impl ExporterBuilder<Event> for DemoExporterBuilder {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn r#type(&self) -> String {
        "stdout".into()
    }

    fn concurrency_model(&self) -> ConcurrencyModel {
        ConcurrencyModel::Singleton
    }

    fn build(&self) -> Result<Box<dyn AsyncExporter<Event> + Send + Sync>, Error> {
        Ok(Box::new(DestinationWorker::new(
            self.name.clone(),
            DestinationWorkerConfig::default(),
            Box::new(StdoutSink),
        )))
    }
}

/// Resolves `stdout/*` exporter entries to a [`DestinationWorker`] backed
/// by [`StdoutSink`], the only destination this workspace ships.
#[derive(Default)]
pub struct DemoExporterFactory {}

impl ExporterFactory<Event> for DemoExporterFactory {
    fn builder(
        &self,
        exporter_name: &str,
        exporter_type: &str,
        _config: Value,
    ) -> Option<Box<dyn ExporterBuilder<Event> + Send + Sync>> {
        match exporter_type {
            "stdout" => Some(Box::new(DemoExporterBuilder {
                name: exporter_name.to_string(),
            })),
            _ => None,
        }
    }
}
