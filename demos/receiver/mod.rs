use std::sync::Arc;

use event::Event;
use persist::PersistFile;
use receiver::log_source::{LogSource, WindowRegistry};
use receiver::{AsyncReceiver, Error, ReceiverFactory};
use serde_yaml::Value;

/// Resolves `log_source/*` receiver entries to [`LogSource`], the only
/// receiver this workspace ships. Carries its own throwaway persist
/// file and window registry, since the demo binaries never reload.
pub struct DemoReceiverFactory {
    persist: Arc<PersistFile>,
    windows: WindowRegistry,
    _persist_dir: tempfile::TempDir,
}

impl Default for DemoReceiverFactory {
    fn default() -> Self {
        let persist_dir = tempfile::tempdir().expect("failed to create demo persist dir");
        let persist = Arc::new(
            PersistFile::open(persist_dir.path().join("demo.persist")).expect("failed to open demo persist file"),
        );
        Self {
            persist,
            windows: WindowRegistry::default(),
            _persist_dir: persist_dir,
        }
    }
}

impl ReceiverFactory<Event> for DemoReceiverFactory {
    fn create(
        &self,
        receiver_name: &str,
        receiver_type: &str,
        config: Value,
    ) -> Result<Box<dyn AsyncReceiver<Event> + Send + Sync>, Error> {
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
            _ => Err(Error::UnknownReceiver {
                receiver: receiver_name.into(),
                receiver_type: receiver_type.into(),
            }),
        }
    }
}
