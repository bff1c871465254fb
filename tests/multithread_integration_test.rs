use std::time::Duration;

use color_eyre::eyre::Result;
use engine::{multi_threaded, Command, Engine, Error};
use task::labels::ProcessLabels;

use crate::{
    common::{available_tcp_port, init, send_syslog_lines, write_pipeline_config},
    exporter::TestExporterFactory,
    processor::TestProcessorFactory,
    receiver::TestReceiverFactory,
};

mod common;
mod exporter;
mod processor;
mod receiver;

/// Sends a handful of RFC 3164 lines through a TCP `log_source` receiver,
/// an `add_field` processor, and a counting exporter, then checks that
/// every line arrived in order and that the multi-threaded engine built
/// exactly one instance of each component (it runs a single pipeline
/// instance for the whole process).
#[test]
fn multithread_engine() -> Result<(), Error> {
    init().expect("failed to initialize tracing");

    let receiver_port = available_tcp_port(51050);
    let config_path = std::env::temp_dir().join(format!("df_engine_multithread_test_{receiver_port}.yaml"));
    write_pipeline_config(&config_path, receiver_port);

    let mut engine = multi_threaded::Engine::new(
        TestReceiverFactory::default(),
        TestProcessorFactory::default(),
        TestExporterFactory::default(),
    );
    let command_handler = engine.command_handler();

    let lines = [
        "<13>Jul 27 10:00:00 host app: first message",
        "<13>Jul 27 10:00:01 host app: second message",
        "<13>Jul 27 10:00:02 host app: third message",
    ];

    let driver = std::thread::spawn(move || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(async move {
                send_syslog_lines(receiver_port, &lines).await;
                // Lets the pipeline flush the batch before tearing it down.
                tokio::time::sleep(Duration::from_millis(500)).await;
                command_handler.send(Command::StopAll).expect("failed to send StopAll");
            });
    });

    engine.run(ProcessLabels::new("test"), config_path.clone())?;
    driver.join().expect("driver thread panicked");
    let _ = std::fs::remove_file(&config_path);

    {
        let counters = receiver::COUNTERS.lock().expect("failed to lock receiver counters");
        assert_eq!(counters.created_count, 1);
    }
    {
        let counters = processor::COUNTERS.lock().expect("failed to lock processor counters");
        assert_eq!(counters.created_count, 1);
    }
    {
        let counters = exporter::COUNTERS.lock().expect("failed to lock exporter counters");
        assert_eq!(counters.created_count, 1);
        assert_eq!(counters.messages, vec!["first message", "second message", "third message"]);
    }

    Ok(())
}
