use std::sync::{Arc, Mutex};

use event::Event;
use once_cell::sync::Lazy;
use persist::PersistFile;
use receiver::log_source::{LogSource, WindowRegistry};
use receiver::{AsyncReceiver, Error, ReceiverFactory};
use serde_yaml::Value;

pub static COUNTERS: Lazy<Mutex<Counters>> = Lazy::new(|| Mutex::new(Counters::default()));

/// Counts how many times the factory built a `log_source`, one call per
/// pipeline instance the engine brings up.
#[derive(Default, Debug)]
pub struct Counters {
    pub created_count: usize,
}

pub struct TestReceiverFactory {
    persist: Arc<PersistFile>,
    windows: WindowRegistry,
    _persist_dir: tempfile::TempDir,
}

impl Default for TestReceiverFactory {
    fn default() -> Self {
        let persist_dir = tempfile::tempdir().expect("failed to create temp persist dir");
        let persist = Arc::new(
            PersistFile::open(persist_dir.path().join("test.persist")).expect("failed to open test persist file"),
        );
        Self {
            persist,
            windows: WindowRegistry::default(),
            _persist_dir: persist_dir,
        }
    }
}

impl TestReceiverFactory {
    /// Hands out the same window registry the factory's `log_source`
    /// receivers register into, so a test can check a window survives
    /// unchanged across a reload of the engine that owns this factory.
    pub fn windows(&self) -> WindowRegistry {
        self.windows.clone()
    }
}

impl ReceiverFactory<Event> for TestReceiverFactory {
    fn create(
        &self,
        receiver_name: &str,
        receiver_type: &str,
        config: Value,
    ) -> Result<Box<dyn AsyncReceiver<Event> + Send + Sync>, Error> {
        match receiver_type {
            "log_source" => {
                COUNTERS.lock().expect("lock failed").created_count += 1;
                let source =
                    LogSource::from_config(receiver_name.to_string(), config, self.persist.clone(), self.windows.clone())?;
                Ok(Box::new(source) as Box<dyn AsyncReceiver<Event> + Send + Sync>)
            }
            _ => Err(Error::UnknownReceiver {
                receiver: receiver_name.into(),
                receiver_type: receiver_type.into(),
            }),
        }
    }
}
