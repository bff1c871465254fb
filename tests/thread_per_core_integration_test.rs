use std::time::Duration;

use color_eyre::eyre::Result;
use engine::{thread_per_core, Command, Engine, Error};
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

/// Same pipeline as the multi-threaded test, but run one instance per
/// core (thread-per-core engine): every core's `log_source` binds the
/// same address via `SO_REUSEPORT`, so the kernel hands the single test
/// connection to exactly one of them. Checks that every component was
/// built once per core and that the lines still arrive exactly once,
/// in order, regardless of which core's instance handled them.
#[test]
fn thread_per_core_engine() -> Result<(), Error> {
    init().expect("failed to initialize tracing");

    let receiver_port = available_tcp_port(51060);
    let config_path = std::env::temp_dir().join(format!("df_engine_thread_per_core_test_{receiver_port}.yaml"));
    write_pipeline_config(&config_path, receiver_port);

    let mut engine = thread_per_core::Engine::new(
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
                tokio::time::sleep(Duration::from_millis(500)).await;
                command_handler.send(Command::StopAll).expect("failed to send StopAll");
            });
    });

    engine.run(ProcessLabels::new("test"), config_path.clone())?;
    driver.join().expect("driver thread panicked");
    let _ = std::fs::remove_file(&config_path);

    let cpu_count = num_cpus::get();
    {
        let counters = receiver::COUNTERS.lock().expect("failed to lock receiver counters");
        assert_eq!(counters.created_count, cpu_count);
    }
    {
        let counters = processor::COUNTERS.lock().expect("failed to lock processor counters");
        assert_eq!(counters.created_count, cpu_count);
    }
    {
        let counters = exporter::COUNTERS.lock().expect("failed to lock exporter counters");
        assert_eq!(counters.created_count, cpu_count);
        assert_eq!(counters.messages, vec!["first message", "second message", "third message"]);
    }

    Ok(())
}
