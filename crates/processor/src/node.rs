//! Graph dispatch (C5): a `Node` is the processing step the graph visits
//! depth-first at each event. A `NodeProcessor` adapts one `Node` into
//! this crate's `AsyncProcessor<Event>`, turning its output into effect
//! handler calls. Grounded on the original `log-pipe`/filter dispatch
//! (`lib/logpipe.h`): each pipe either drops, forwards, or fans an event
//! out to its successors; refcount increments (not copies) pay for the
//! fan-out.

use async_trait::async_trait;
use event::{AckOutcome, Event, Value};
use signal::Signal;

use crate::{AsyncProcessor, EffectHandler, Error};

/// What kind of step a `Node` performs; informational, used by
/// configuration validation to flag nonsensical graphs (e.g. a
/// `Terminal` node followed by more processors).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// May drop events; never increases the event count.
    Filter,
    /// Produces exactly one output event per input, never drops.
    Transform,
    /// Sends an event to a named subset of exporters instead of all of
    /// them.
    Router,
    /// Consumes the event itself (e.g. an in-graph counter); never
    /// forwards.
    Terminal,
}

/// Result of visiting one `Node` with one event (§4.7, C5).
pub enum NodeOutput {
    /// The event is dropped; the caller marks it `Dropped` and releases
    /// its reference, which fires the ack callback if this was the last
    /// reference.
    Drop(Event),
    /// The event (possibly mutated) continues to every exporter.
    Forward(Event),
    /// The event continues, but only to the named exporters.
    Route {
        /// Exporter names to route to.
        exporters: Vec<String>,
        /// The event being routed.
        event: Event,
    },
    /// The input fans out to zero or more independent output events.
    /// Each output that survives holds its own reference; the original
    /// input event is consumed by this call (callers must not reuse it).
    Fanout(Vec<Event>),
}

/// One step of the processing graph.
pub trait Node: Send {
    /// Informational category used by configuration validation.
    fn kind(&self) -> NodeKind;

    /// Applies this node's logic to one event.
    fn apply(&mut self, event: Event) -> NodeOutput;
}

/// Adapts a `Node` into an `AsyncProcessor<Event>`, the unit the engine's
/// processor chain actually runs.
pub struct NodeProcessor {
    name: String,
    node: Box<dyn Node>,
}

impl NodeProcessor {
    /// Wraps `node` for the processor chain, identified by `name` in
    /// logs and errors.
    pub fn new(name: String, node: Box<dyn Node>) -> Self {
        Self { name, node }
    }

    fn dispatch(&mut self, event: Event, effect_handler: &mut EffectHandler<Event>) {
        let kind = self.node.kind();
        match self.node.apply(event) {
            NodeOutput::Drop(event) => {
                event.set_disposition(AckOutcome::Dropped);
                event.unref();
            }
            NodeOutput::Forward(event) => effect_handler.emit_message(event),
            NodeOutput::Route { exporters, event } => effect_handler.route_message(&exporters, event),
            NodeOutput::Fanout(events) => {
                if kind == NodeKind::Filter && events.len() > 1 {
                    tracing::error!(
                        node = %self.name,
                        count = events.len(),
                        "filter node emitted more events than it consumed"
                    );
                }
                for event in events {
                    effect_handler.emit_message(event);
                }
            }
        }
    }
}

#[async_trait]
impl AsyncProcessor<Event> for NodeProcessor {
    async fn process(&mut self, signal: Signal<Event>, effect_handler: &mut EffectHandler<Event>) -> Result<(), Error> {
        match signal {
            Signal::TimerTick { .. } => Ok(()),
            Signal::Messages { messages } => {
                for event in messages {
                    self.dispatch(event, effect_handler);
                }
                Ok(())
            }
            Signal::Stop => Ok(()),
            _ => Err(Error::UnsupportedEvent {
                processor: self.name.clone(),
                signal: signal.to_string(),
            }),
        }
    }
}

/// A `Filter` node that drops events whose named field is absent or
/// equal to `Value::Bool(false)`.
pub struct FieldFilter {
    field: String,
}

impl FieldFilter {
    /// Builds a filter keyed on `field`.
    pub fn new(field: String) -> Self {
        Self { field }
    }
}

impl Node for FieldFilter {
    fn kind(&self) -> NodeKind {
        NodeKind::Filter
    }

    fn apply(&mut self, event: Event) -> NodeOutput {
        match event.get(&self.field) {
            Some(Value::Bool(false)) | None => NodeOutput::Drop(event),
            _ => NodeOutput::Forward(event),
        }
    }
}

/// A `Transform` node that sets (or overwrites) a static field on every
/// event. Forks the event first if it is shared, so mutation never
/// races a sibling holder created upstream by a fan-out.
pub struct AddField {
    field: String,
    value: Value,
}

impl AddField {
    /// Builds a transform that sets `field` to `value` on every event.
    pub fn new(field: String, value: Value) -> Self {
        Self { field, value }
    }
}

impl Node for AddField {
    fn kind(&self) -> NodeKind {
        NodeKind::Transform
    }

    fn apply(&mut self, event: Event) -> NodeOutput {
        let mut event = if event.ref_count() > 1 { event.fork() } else { event };
        match event.set(self.field.clone(), self.value.clone()) {
            Ok(()) => NodeOutput::Forward(event),
            Err(err) => {
                tracing::error!(field = %self.field, error = %err, "add_field could not mutate event");
                NodeOutput::Forward(event)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use event::EventMeta;

    #[test]
    fn field_filter_drops_on_missing_field() {
        let mut node = FieldFilter::new("keep".into());
        let event = Event::new(EventMeta::default());
        assert!(matches!(node.apply(event), NodeOutput::Drop(_)));
    }

    #[test]
    fn field_filter_forwards_on_true() {
        let mut node = FieldFilter::new("keep".into());
        let mut event = Event::new(EventMeta::default());
        event.set("keep", Value::Bool(true)).unwrap();
        assert!(matches!(node.apply(event), NodeOutput::Forward(_)));
    }

    #[test]
    fn add_field_sets_value() {
        let mut node = AddField::new("tag".into(), Value::String("x".into()));
        let event = Event::new(EventMeta::default());
        match node.apply(event) {
            NodeOutput::Forward(event) => {
                assert_eq!(event.get("tag"), Some(&Value::String("x".into())));
            }
            _ => panic!("expected forward"),
        }
    }
}
