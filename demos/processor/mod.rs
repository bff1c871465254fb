use event::{Event, Value as EventValue};
use processor::node::{AddField, FieldFilter, NodeProcessor};
use processor::{AsyncProcessor, Error, ProcessorFactory};
use serde_yaml::Value;

/// Resolves `filter/*` and `add_field/*` processor entries to the
/// matching [`processor::node::Node`] impl, wrapped in a [`NodeProcessor`].
#[derive(Default)]
pub struct DemoProcessorFactory {}

impl ProcessorFactory<Event> for DemoProcessorFactory {
    fn create(
        &self,
        processor_name: &str,
        processor_type: &str,
        config: Value,
    ) -> Result<Box<dyn AsyncProcessor<Event> + Send + Sync>, Error> {
        match processor_type {
            "filter" => {
                let field = config
                    .get("field")
                    .and_then(Value::as_str)
                    .unwrap_or("keep")
                    .to_string();
                let node = FieldFilter::new(field);
                Ok(Box::new(NodeProcessor::new(processor_name.to_string(), Box::new(node))))
            }
            "add_field" => {
                let field = config
                    .get("field")
                    .and_then(Value::as_str)
                    .unwrap_or("tag")
                    .to_string();
                let value = config
                    .get("value")
                    .and_then(Value::as_str)
                    .unwrap_or("demo")
                    .to_string();
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
