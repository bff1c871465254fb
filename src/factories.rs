//! Concrete receiver/processor/exporter factories wiring the domain
//! crates' `Event`-typed implementations into `config::Config<Event>`.
//! One entry per component type this binary knows how to build; the
//! component's configured *name* (`<type>/<instance>`) selects which
//! one via `extract_type`.

use std::sync::Arc;
use std::time::Duration;

use event::{Event, Value as EventValue};
use exporter::destination_worker::{DestinationWorker, DestinationWorkerConfig, StdoutSink};
use exporter::{AsyncExporter, ConcurrencyModel, ExporterBuilder, ExporterFactory};
use persist::PersistFile;
use processor::node::{AddField, FieldFilter, NodeProcessor};
use processor::{AsyncProcessor, ProcessorFactory};
use queue::{DiskQueue, PersistentQueue};
use receiver::internal_source::InternalSource;
use receiver::log_source::{LogSource, WindowRegistry};
use receiver::{AsyncReceiver, ReceiverFactory};
use serde::Deserialize;
use serde_yaml::Value;

/// Resolves `log_source/*` and `internal/*` receiver entries. Carries
/// the persist handle and per-source window registry so both survive a
/// reload unchanged (§4.3(c), §4.8): this struct is built once in
/// `main` and the same `Arc` is handed to every `Config::load_with_factories`
/// call, including the one a reload makes.
pub struct StandardReceiverFactory {
    persist: Arc<PersistFile>,
    windows: WindowRegistry,
}

impl StandardReceiverFactory {
    pub fn new(persist: Arc<PersistFile>) -> Self {
        Self {
            persist,
            windows: Default::default(),
        }
    }
}

impl ReceiverFactory<Event> for StandardReceiverFactory {
    fn create(
        &self,
        receiver_name: &str,
        receiver_type: &str,
        config: Value,
    ) -> Result<Box<dyn AsyncReceiver<Event> + Send + Sync>, receiver::Error> {
        match receiver_type {
            "log_source" => {
                let source = LogSource::from_config(
                    receiver_name.to_string(),
                    config,
                    self.persist.clone(),
                    self.windows.clone(),
                )?;
                Ok(Box::new(source) as Box<dyn AsyncReceiver<Event> + Send + Sync>)
            }
            "internal" => {
                let source = InternalSource::from_config(receiver_name.to_string(), config)?;
                Ok(Box::new(source) as Box<dyn AsyncReceiver<Event> + Send + Sync>)
            }
            _ => Err(receiver::Error::UnknownReceiver {
                receiver: receiver_name.into(),
                receiver_type: receiver_type.into(),
            }),
        }
    }
}

/// Resolves `filter/*` and `add_field/*` processor entries.
#[derive(Default)]
pub struct StandardProcessorFactory;

impl ProcessorFactory<Event> for StandardProcessorFactory {
    fn create(
        &self,
        processor_name: &str,
        processor_type: &str,
        config: Value,
    ) -> Result<Box<dyn AsyncProcessor<Event> + Send + Sync>, processor::Error> {
        match processor_type {
            "filter" => {
                let field = config
                    .get("field")
                    .and_then(Value::as_str)
                    .ok_or_else(|| processor::Error::InvalidConfig {
                        processor: processor_name.into(),
                        message: "missing 'field'".into(),
                        line: None,
                        column: None,
                    })?
                    .to_string();
                let node = FieldFilter::new(field);
                Ok(Box::new(NodeProcessor::new(processor_name.to_string(), Box::new(node))))
            }
            "add_field" => {
                let field = config
                    .get("field")
                    .and_then(Value::as_str)
                    .ok_or_else(|| processor::Error::InvalidConfig {
                        processor: processor_name.into(),
                        message: "missing 'field'".into(),
                        line: None,
                        column: None,
                    })?
                    .to_string();
                let value = config
                    .get("value")
                    .and_then(Value::as_str)
                    .ok_or_else(|| processor::Error::InvalidConfig {
                        processor: processor_name.into(),
                        message: "missing 'value'".into(),
                        line: None,
                        column: None,
                    })?
                    .to_string();
                let node = AddField::new(field, EventValue::String(value.into()));
                Ok(Box::new(NodeProcessor::new(processor_name.to_string(), Box::new(node))))
            }
            _ => Err(processor::Error::UnknownProcessor {
                processor: processor_name.into(),
                r#type: processor_type.into(),
            }),
        }
    }
}

/// Where a `stdout/*` exporter's internal durable queue lives.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "queue", rename_all = "snake_case")]
enum QueueConfig {
    Memory,
    Disk {
        /// Directory holding the queue's segment files.
        dir: String,
        /// Size of one segment before it is rotated, in bytes.
        #[serde(default = "default_segment_bytes")]
        segment_bytes: u64,
    },
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig::Memory
    }
}

fn default_segment_bytes() -> u64 {
    64 * 1024 * 1024
}

/// Configuration accepted by a `stdout/*` exporter entry.
#[derive(Debug, Clone, Deserialize)]
struct StdoutExporterConfig {
    #[serde(default = "default_batch_size")]
    batch_size: usize,
    #[serde(default = "default_batch_deadline_ms")]
    batch_deadline_ms: u64,
    #[serde(default = "default_backoff_initial_ms")]
    backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    backoff_max_ms: u64,
    #[serde(default = "default_queue_capacity")]
    queue_capacity: usize,
    #[serde(flatten)]
    queue: QueueConfig,
}

fn default_batch_size() -> usize {
    100
}
fn default_batch_deadline_ms() -> u64 {
    1000
}
fn default_backoff_initial_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_queue_capacity() -> usize {
    10_000
}

struct StdoutExporterBuilder {
    name: String,
    config: StdoutExporterConfig,
}

impl ExporterBuilder<Event> for StdoutExporterBuilder {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn r#type(&self) -> String {
        "stdout".into()
    }

    fn concurrency_model(&self) -> ConcurrencyModel {
        ConcurrencyModel::Singleton
    }

    fn build(&self) -> Result<Box<dyn AsyncExporter<Event> + Send + Sync>, exporter::Error> {
        let worker_config = DestinationWorkerConfig {
            batch_size: self.config.batch_size,
            batch_deadline: Duration::from_millis(self.config.batch_deadline_ms),
            backoff_initial: Duration::from_millis(self.config.backoff_initial_ms),
            backoff_max: Duration::from_millis(self.config.backoff_max_ms),
            queue_capacity: self.config.queue_capacity,
            on_error: codec::OnErrorFlags::default(),
        };
        let worker = DestinationWorker::new(self.name.clone(), worker_config, Box::new(StdoutSink));

        let worker = match &self.config.queue {
            QueueConfig::Memory => worker,
            QueueConfig::Disk { dir, segment_bytes } => {
                let disk_queue = DiskQueue::open(dir.clone(), self.name.clone(), *segment_bytes, self.config.queue_capacity).map_err(|err| {
                    exporter::Error::InvalidConfig {
                        exporter: self.name.clone(),
                        message: err.to_string(),
                        line: None,
                        column: None,
                    }
                })?;
                worker.with_queue(Box::new(disk_queue) as Box<dyn PersistentQueue>)
            }
        };

        Ok(Box::new(worker))
    }
}

/// Resolves `stdout/*` exporter entries.
#[derive(Default)]
pub struct StandardExporterFactory;

impl ExporterFactory<Event> for StandardExporterFactory {
    fn builder(
        &self,
        exporter_name: &str,
        exporter_type: &str,
        config: Value,
    ) -> Option<Box<dyn ExporterBuilder<Event> + Send + Sync>> {
        match exporter_type {
            "stdout" => {
                let config: StdoutExporterConfig = serde_yaml::from_value(config).ok()?;
                Some(Box::new(StdoutExporterBuilder {
                    name: exporter_name.to_string(),
                    config,
                }))
            }
            _ => None,
        }
    }
}
