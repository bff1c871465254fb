use std::sync::Mutex;

use event::{Event, Value as EventValue};
use once_cell::sync::Lazy;
use processor::node::{AddField, NodeProcessor};
use processor::{AsyncProcessor, Error, ProcessorFactory};
use serde_yaml::Value;

pub static COUNTERS: Lazy<Mutex<Counters>> = Lazy::new(|| Mutex::new(Counters::default()));

/// Counts how many times the factory built an `add_field` processor.
#[derive(Default, Debug)]
pub struct Counters {
    pub created_count: usize,
}

#[derive(Default)]
pub struct TestProcessorFactory {}

impl ProcessorFactory<Event> for TestProcessorFactory {
    fn create(
        &self,
        processor_name: &str,
        processor_type: &str,
        config: Value,
    ) -> Result<Box<dyn AsyncProcessor<Event> + Send + Sync>, Error> {
        match processor_type {
            "add_field" => {
                COUNTERS.lock().expect("lock failed").created_count += 1;
                let field = config.get("field").and_then(Value::as_str).unwrap_or("tag").to_string();
                let value = config.get("value").and_then(Value::as_str).unwrap_or("test").to_string();
                let node = AddField::new(field, EventValue::String(value.into()));
                Ok(Box::new(NodeProcessor::new(processor_name.to_string(), Box::new(node))))
            }
            _ => Err(Error::UnknownProcessor {
                processor: processor_name.into(),
                r#type: processor_type.into(),
            }),
        }
    }
}
