//! Test cases for socket connections against local TCP and UDP servers.

use std::{
    io::{BufRead, BufReader, Write},
    net::{TcpListener, UdpSocket},
    thread,
    time::{Duration, Instant},
};

use rstest::*;

use labconnect::{
    ConnectionConfig, InstrumentError, InstrumentInterface, MessageBased, MessagePolicy,
    PrologixRegistry, connect,
    transport::{SocketSettings, SocketTransport},
};

/// Bind a listener on an ephemeral port.
#[fixture]
fn listener() -> TcpListener {
    TcpListener::bind("127.0.0.1:0").unwrap()
}

/// Echo every line of `connections` clients back to them.
fn spawn_echo_server(listener: TcpListener, connections: usize) {
    thread::spawn(move || {
        for stream in listener.incoming().take(connections) {
            let mut stream = stream.unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap_or(0) > 0 {
                stream.write_all(line.as_bytes()).unwrap();
                line.clear();
            }
        }
    });
}

fn crt_socket(port: u16, timeout: Option<f64>) -> MessageBased<SocketTransport> {
    let mut policy = MessagePolicy::default();
    policy.set_timeout(timeout);
    policy.set_read_termination(Some("\r\n".into())).unwrap();
    let transport =
        SocketTransport::try_new("127.0.0.1", port, SocketSettings::default(), policy.timeout())
            .unwrap();
    MessageBased::new(&format!("TCP::127.0.0.1::{port}"), transport, policy).unwrap()
}

#[rstest]
fn tcp_echo(listener: TcpListener) {
    let port = listener.local_addr().unwrap().port();
    spawn_echo_server(listener, 1);

    let mut inst = crt_socket(port, Some(2.0));
    assert_eq!(inst.query("PING").unwrap(), "PING");
    assert_eq!(inst.query("*IDN?").unwrap(), "*IDN?");
    inst.disconnect();
    assert!(!inst.is_connected());
}

#[rstest]
fn reconnects_once_after_reset(listener: TcpListener) {
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let mut incoming = listener.incoming();

        // answer half a message, then hang up
        let stream = incoming.next().unwrap().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        (&stream).write_all(b"HE").unwrap();
        drop(reader);
        drop(stream);

        let mut stream = incoming.next().unwrap().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut line = String::new();
        while reader.read_line(&mut line).unwrap_or(0) > 0 {
            stream.write_all(line.as_bytes()).unwrap();
            line.clear();
        }
    });

    let mut inst = crt_socket(port, Some(2.0));
    assert_eq!(inst.query("HELLO").unwrap(), "HELLO");
    assert_eq!(inst.transport().reconnect_count(), 1);
    assert_eq!(inst.transport().buffered_len(), 0);
}

#[rstest]
fn silent_server_times_out(listener: TcpListener) {
    let port = listener.local_addr().unwrap().port();
    let mut inst = crt_socket(port, Some(0.2));

    let start = Instant::now();
    let err = inst.read().unwrap_err();
    let elapsed = start.elapsed();
    assert!(err.is_timeout());
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(1200));
    assert!(err.to_string().contains(&format!("TCP::127.0.0.1::{port}")));
    drop(listener);
}

#[rstest]
fn bytes_after_message_stay_buffered(listener: TcpListener) {
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(b"A\r\nB\r\n").unwrap();
        thread::sleep(Duration::from_secs(1));
    });

    let mut inst = crt_socket(port, Some(2.0));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(inst.read().unwrap(), "A");
    assert_eq!(inst.transport().buffered_len(), 3);
    assert_eq!(inst.read().unwrap(), "B");
}

#[rstest]
fn connection_refused_is_a_connection_error() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = ConnectionConfig::new(&format!("TCP::127.0.0.1::{port}"))
        .with_property("timeout", 1.0);
    let err = connect(&config, &PrologixRegistry::new()).err().unwrap();
    assert!(matches!(err, InstrumentError::Connection { .. }));
    assert!(err.is_connection_error());
    assert!(!err.is_timeout());
}

#[rstest]
fn udp_echo() {
    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = server.local_addr().unwrap().port();
    thread::spawn(move || {
        let mut buf = [0u8; 1024];
        let (len, peer) = server.recv_from(&mut buf).unwrap();
        server.send_to(&buf[..len], peer).unwrap();
    });

    let config = ConnectionConfig::new(&format!("UDP::127.0.0.1::{port}"))
        .with_property("timeout", 2.0)
        .with_property("read_termination", "\r\n");
    let mut inst = connect(&config, &PrologixRegistry::new()).unwrap();
    assert_eq!(inst.query("PING").unwrap(), "PING");
}

#[rstest]
fn connect_from_toml(listener: TcpListener) {
    let port = listener.local_addr().unwrap().port();
    spawn_echo_server(listener, 1);

    let config: ConnectionConfig = toml::from_str(&format!(
        r#"
        address = "TCPIP0::127.0.0.1::{port}::SOCKET"
        interface = "socket"

        [properties]
        timeout = 2.0
        termination = "\r\n"
        buffer_size = 64
        family = "AF_INET"
        socket_type = "SOCK_STREAM"
        "#
    ))
    .unwrap();
    let mut inst = connect(&config, &PrologixRegistry::new()).unwrap();
    assert_eq!(inst.query("MEAS:VOLT?").unwrap(), "MEAS:VOLT?");
    assert_eq!(inst.timeout(), Some(Duration::from_secs(2)));
}

#[rstest]
fn socket_type_must_match_address() {
    let config = ConnectionConfig::new("UDP::127.0.0.1::9")
        .with_property("socket_type", "SOCK_STREAM");
    let err = connect(&config, &PrologixRegistry::new()).err().unwrap();
    assert!(err.is_configuration_error());
    assert!(err.to_string().contains("socket_type"), "{err}");
}
