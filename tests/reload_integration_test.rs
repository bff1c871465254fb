use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::Result;
use engine::{multi_threaded, Command, Engine, Error};
use task::labels::ProcessLabels;

use crate::{
    common::{available_tcp_port, init, write_pipeline_config},
    exporter::TestExporterFactory,
    processor::TestProcessorFactory,
    receiver::TestReceiverFactory,
};

mod common;
mod exporter;
mod processor;
mod receiver;

/// A reload must bring the `log_source` receiver back up without
/// resetting the window credit a reconnecting/in-flight client already
/// holds: the registry is shared with the receiver factory across the
/// whole engine lifetime, so the same `WindowSizeCounter` the pipeline
/// registered before the reload is still there, with the same balance,
/// after it.
#[test]
fn reload_reuses_the_receiver_window_instead_of_resetting_it() -> Result<(), Error> {
    init().expect("failed to initialize tracing");

    let receiver_port = available_tcp_port(51070);
    let config_path = std::env::temp_dir().join(format!("df_engine_reload_test_{receiver_port}.yaml"));
    write_pipeline_config(&config_path, receiver_port);
    let receiver_name = "log_source/tcp_in".to_string();

    let factory = TestReceiverFactory::default();
    let windows = factory.windows();
    let mut engine = multi_threaded::Engine::new(factory, TestProcessorFactory::default(), TestExporterFactory::default());
    let command_handler = engine.command_handler();

    let driver_config_path = config_path.to_string_lossy().to_string();
    let driver = std::thread::spawn(move || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(async move {
                let window_before = wait_for_window(&windows, &receiver_name).await;
                window_before.request(400);
                assert_eq!(window_before.available(), window_before.capacity() - 400);

                command_handler
                    .send(Command::Reload { config_file_path: driver_config_path })
                    .expect("failed to send Reload");
                // Lets the reload tear down and rebuild the pipeline.
                tokio::time::sleep(Duration::from_millis(500)).await;

                let window_after = windows
                    .lock()
                    .expect("window registry mutex poisoned")
                    .get(&receiver_name)
                    .cloned()
                    .expect("window missing from the registry after reload");
                assert!(
                    Arc::ptr_eq(&window_before, &window_after),
                    "reload rebuilt the window counter instead of reusing the one already registered"
                );
                assert_eq!(
                    window_after.available(),
                    window_before.capacity() - 400,
                    "reload reset in-flight window credit instead of carrying it over"
                );

                command_handler.send(Command::StopAll).expect("failed to send StopAll");
            });
    });

    engine.run(ProcessLabels::new("test"), config_path.clone())?;
    driver.join().expect("driver thread panicked");
    let _ = std::fs::remove_file(&config_path);

    {
        let counters = receiver::COUNTERS.lock().expect("failed to lock receiver counters");
        // Built once for the initial load and once more for the reload.
        assert_eq!(counters.created_count, 2);
    }

    Ok(())
}

/// Polls the registry until `name`'s window counter shows up, which
/// happens as soon as the receiver factory builds the pipeline's
/// `log_source`.
async fn wait_for_window(windows: &receiver::log_source::WindowRegistry, name: &str) -> Arc<window::WindowSizeCounter> {
    let started_at = std::time::Instant::now();
    loop {
        if let Some(window) = windows.lock().expect("window registry mutex poisoned").get(name).cloned() {
            return window;
        }
        if started_at.elapsed() > Duration::from_secs(5) {
            panic!("window for '{name}' never registered");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
