use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use event::Event;
use exporter::destination_worker::{DestinationSink, DestinationWorker, DestinationWorkerConfig};
use exporter::{AsyncExporter, ConcurrencyModel, Error, ExporterBuilder, ExporterFactory};
use once_cell::sync::Lazy;
use serde_yaml::Value;

pub static COUNTERS: Lazy<Mutex<Counters>> = Lazy::new(|| Mutex::new(Counters::default()));

/// Counts how many times the factory built a `counting` exporter and
/// records each delivered event's `message` field, in delivery order.
#[derive(Default, Debug)]
pub struct Counters {
    pub created_count: usize,
    pub messages: Vec<String>,
}

/// A [`DestinationSink`] that records delivered messages instead of
/// shipping them anywhere, so the integration tests can assert on what
/// made it all the way through the pipeline.
#[derive(Default)]
struct CountingSink;

#[async_trait]
impl DestinationSink for CountingSink {
    async fn send(&mut self, batch: &[Event]) -> Result<usize, String> {
        let mut counters = COUNTERS.lock().expect("lock failed");
        for event in batch {
            match event.get("message") {
                Some(event::Value::String(s)) => counters.messages.push(s.to_string()),
                _ => counters.messages.push(String::new()),
            }
        }
        Ok(batch.len())
    }
}

struct TestExporterBuilder {
    name: String,
}

impl ExporterBuilder<Event> for TestExporterBuilder {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn r#type(&self) -> String {
        "counting".into()
    }

    fn concurrency_model(&self) -> ConcurrencyModel {
        ConcurrencyModel::Singleton
    }

    fn build(&self) -> Result<Box<dyn AsyncExporter<Event> + Send + Sync>, Error> {
        COUNTERS.lock().expect("lock failed").created_count += 1;
        let config = DestinationWorkerConfig {
            batch_size: 1,
            batch_deadline: Duration::from_millis(50),
            ..Default::default()
        };
        Ok(Box::new(DestinationWorker::new(self.name.clone(), config, Box::new(CountingSink))))
    }
}

#[derive(Default)]
pub struct TestExporterFactory {}

impl ExporterFactory<Event> for TestExporterFactory {
    fn builder(
        &self,
        exporter_name: &str,
        exporter_type: &str,
        _config: Value,
    ) -> Option<Box<dyn ExporterBuilder<Event> + Send + Sync>> {
        match exporter_type {
            "counting" => Some(Box::new(TestExporterBuilder {
                name: exporter_name.to_string(),
            })),
            _ => None,
        }
    }
}
