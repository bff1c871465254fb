use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use color_eyre::eyre::Result;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

fn try_bind_tcp<A: ToSocketAddrs>(addr: A) -> Option<u16> {
    Some(std::net::TcpListener::bind(addr).ok()?.local_addr().ok()?.port())
}

/// Checks whether `port` is free on both IPv4 and IPv6.
pub fn is_free_tcp(port: u16) -> bool {
    let ipv4 = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    let ipv6 = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0);

    try_bind_tcp(ipv6).is_some() && try_bind_tcp(ipv4).is_some()
}

/// Initializes logs and traces for the integration tests.
pub fn init() -> Result<()> {
    color_eyre::install()?;

    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    Ok(())
}

/// Scans forward from `first_port_to_scan` for a free TCP port.
pub fn available_tcp_port(first_port_to_scan: u16) -> u16 {
    let mut port = first_port_to_scan;
    while !is_free_tcp(port) {
        port += 1;
        if port > 65534 {
            panic!("could not find an available TCP port starting at {first_port_to_scan}");
        }
    }
    port
}

/// Writes a one-receiver/one-processor/one-exporter pipeline config at
/// `path`, binding the `log_source` receiver to `receiver_port`.
pub fn write_pipeline_config(path: &Path, receiver_port: u16) {
    let yaml = format!(
        r#"
receivers:
  log_source/tcp_in:
    bind: "127.0.0.1:{receiver_port}"
    transport: tcp
    format: line_syslog
    on_error: drop-message
    window_capacity: 1000
    ack_strategy: instant

processors:
  add_field/tag_test:
    field: source
    value: integration-test

exporters:
  counting/sink: {{}}

service:
  pipelines:
    test:
      receivers:
        - log_source/tcp_in
      processors:
        - add_field/tag_test
      exporters:
        - counting/sink
"#
    );
    std::fs::write(path, yaml).expect("failed to write test pipeline config");
}

/// Connects to the `log_source` receiver listening on `tcp_port`,
/// retrying until it accepts or a 5-second timeout elapses, writes each
/// of `lines` as a newline-terminated RFC 3164 frame over one
/// connection, then closes it.
pub async fn send_syslog_lines(tcp_port: u16, lines: &[&str]) {
    let started_at = std::time::Instant::now();
    let mut stream = loop {
        match TcpStream::connect(format!("127.0.0.1:{tcp_port}")).await {
            Ok(stream) => break stream,
            Err(e) => {
                if started_at.elapsed() > Duration::from_secs(5) {
                    panic!("log source not ready after 5 seconds (port: {tcp_port}): {e}");
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    };

    for line in lines {
        stream.write_all(line.as_bytes()).await.expect("failed to write line");
        stream.write_all(b"\n").await.expect("failed to write newline");
    }
}
