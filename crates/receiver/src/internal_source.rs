//! Internal diagnostics source (§7): "the internal source is itself a
//! first-class source". Error paths across the workspace that have no
//! local recovery push a structured `Event` via `event::internal`
//! instead of only logging it, so a pipeline can route its own
//! diagnostics through the same graph as any other input (e.g. an
//! `add_field`/`filter` node, or a destination). The channel lives in
//! the `event` crate so any crate already depending on `event` can
//! report without a reverse dependency on `receiver`.

use async_trait::async_trait;
use event::Event;
use serde_yaml::Value;
use tokio::sync::mpsc;

use crate::effect::EffectHandler;
use crate::signal::{Signal, SignalReceiver};
use crate::{AsyncReceiver, Error};

const CHANNEL_CAPACITY: usize = 1024;

/// The `internal` receiver (C7 variant): forwards whatever diagnostic
/// events are pushed through [`event::internal::report`] into this
/// pipeline's graph.
pub struct InternalSource {
    name: String,
    receiver: mpsc::Receiver<Event>,
}

impl InternalSource {
    /// Builds the `internal` receiver, installing the process-wide
    /// channel `event::internal::report` pushes into.
    pub fn from_config(name: String, _config: Value) -> Result<Self, Error> {
        let receiver = event::internal::install(CHANNEL_CAPACITY).ok_or_else(|| Error::InvalidConfig {
            receiver: name.clone(),
            message: "an 'internal' receiver is already configured for this process".into(),
            line: None,
            column: None,
        })?;
        Ok(Self { name, receiver })
    }
}

#[async_trait]
impl AsyncReceiver<Event> for InternalSource {
    async fn receive(
        &mut self,
        mut signal_receiver: SignalReceiver,
        effect_handler: EffectHandler<Event>,
    ) -> Result<(), Error> {
        loop {
            tokio::select! {
                biased;
                signal = signal_receiver.recv() => {
                    if matches!(signal, Signal::Stop) {
                        tracing::debug!(receiver = %self.name, "internal source stopping");
                        return Ok(());
                    }
                }
                event = self.receiver.recv() => {
                    match event {
                        Some(event) => effect_handler.send_messages(vec![event]).await?,
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use event::EventMeta;

    #[test]
    fn report_without_configured_receiver_is_a_noop() {
        event::internal::report(event::Event::new(EventMeta::default()));
    }
}
