//! Test cases for message-based connections on top of the LoopbackTransport.

use std::time::{Duration, Instant};

use rstest::*;

use labconnect::{
    BlockFormat, DataType, InstrumentError, InstrumentInterface, LoopbackEvent, LoopbackTransport,
    MessageBased, MessagePolicy, Termination,
};

type Loopback = MessageBased<LoopbackTransport>;

/// Create a connection with the default policy on a scripted loopback transport.
fn crt_lbk(from_host: &[&str], from_inst: &[&str]) -> Loopback {
    MessageBased::new(
        "loopback",
        LoopbackTransport::from_text(from_host, from_inst),
        MessagePolicy::default(),
    )
    .unwrap()
}

/// A connection without any scripted traffic.
#[fixture]
fn emp_lbk() -> Loopback {
    crt_lbk(&[], &[])
}

#[rstest]
fn query_echo() {
    let mut inst = crt_lbk(&["PING\r\n"], &["PING\n"]);
    assert_eq!(inst.query("PING").unwrap(), "PING");
}

#[rstest]
fn write_does_not_repeat_termination() {
    let mut inst = crt_lbk(&["*RST\r\n", "*CLS\r\n"], &[]);
    assert_eq!(inst.write("*RST").unwrap(), 6);
    assert_eq!(inst.write("*CLS\r\n").unwrap(), 6);
}

#[rstest]
fn read_strips_termination() {
    let mut inst = crt_lbk(&[], &["1.234\n", "5.678\n"]);
    assert_eq!(inst.read().unwrap(), "1.234");
    assert_eq!(inst.read().unwrap(), "5.678");
}

#[rstest]
fn two_messages_in_one_chunk() {
    let mut inst = crt_lbk(&[], &["A\nB\n"]);
    assert_eq!(inst.read().unwrap(), "A");
    assert_eq!(inst.read().unwrap(), "B");
}

#[rstest]
#[case(&["HEL", "LO\r", "\nWORLD\r\n"])]
#[case(&["HELLO\r", "\nWOR", "LD\r", "\n"])]
#[case(&["HELLO\r\nWORLD\r\n"])]
fn termination_straddles_chunks(#[case] chunks: &[&str]) {
    let mut inst = crt_lbk(&[], chunks);
    inst.set_read_termination(Some("\r\n".into())).unwrap();
    assert_eq!(inst.read().unwrap(), "HELLO");
    assert_eq!(inst.read().unwrap(), "WORLD");
}

#[rstest]
fn exact_size_reads() {
    let mut inst = crt_lbk(&[], &["AB\nDEF"]);
    assert_eq!(inst.read_bytes(Some(4)).unwrap().as_ref(), b"AB\nD");
    assert_eq!(inst.read_with(Some(2)).unwrap(), "EF");
}

#[rstest]
fn short_read_never_returns_partial_message() {
    let mut inst = crt_lbk(&[], &["ABC"]);
    inst.set_timeout(Some(0.05)).unwrap();
    let err = inst.read_with(Some(4)).unwrap_err();
    assert!(err.is_timeout());
}

#[rstest]
fn oversized_request_touches_nothing(mut emp_lbk: Loopback) {
    emp_lbk.set_max_read_size(4).unwrap();
    let err = emp_lbk.read_bytes(Some(5)).unwrap_err();
    assert!(matches!(
        err,
        InstrumentError::ExceededMaxReadSize {
            len: 5,
            max_read_size: 4,
            ..
        }
    ));
    assert!(err.is_connection_error());
    assert!(emp_lbk.transport().log().is_empty());
}

#[rstest]
fn unterminated_stream_exceeds_max_read_size() {
    let mut inst = crt_lbk(&[], &["ABCDEFGH"]);
    inst.set_max_read_size(4).unwrap();
    let err = inst.read().unwrap_err();
    assert!(matches!(err, InstrumentError::ExceededMaxReadSize { .. }));
    assert_eq!(
        err.to_string(),
        "loopback: len(message) [8] > max_read_size [4]"
    );
}

#[rstest]
fn terminated_message_exceeds_max_read_size() {
    let mut inst = crt_lbk(&[], &["0123456789ABCDEF\n"]);
    inst.set_max_read_size(8).unwrap();
    let err = inst.read().unwrap_err();
    assert!(matches!(
        err,
        InstrumentError::ExceededMaxReadSize {
            len: 17,
            max_read_size: 8,
            ..
        }
    ));
}

#[rstest]
#[case(0.1)]
#[case(0.25)]
fn silent_device_times_out(mut emp_lbk: Loopback, #[case] seconds: f64) {
    emp_lbk.set_timeout(Some(seconds)).unwrap();
    let timeout = Duration::from_secs_f64(seconds);
    let start = Instant::now();
    let err = emp_lbk.read().unwrap_err();
    let elapsed = start.elapsed();

    assert!(err.is_timeout());
    assert!(elapsed >= timeout, "timed out early after {elapsed:?}");
    assert!(elapsed < timeout + Duration::from_millis(500));
    assert_eq!(emp_lbk.transport().log()[0].1, LoopbackEvent::Timeout);
}

#[rstest]
fn query_waits_between_write_and_read() {
    let mut inst = crt_lbk(&["MEAS?\r\n"], &["42\n"]);
    let delay = Duration::from_millis(100);
    assert_eq!(inst.query_with("MEAS?", delay, None).unwrap(), "42");

    let log = inst.transport().log();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].1, LoopbackEvent::Write(b"MEAS?\r\n".to_vec()));
    assert!(matches!(log[1].1, LoopbackEvent::Read(_)));
    assert!(log[1].0.duration_since(log[0].0) >= delay);
}

#[rstest]
fn operations_after_disconnect_fail(mut emp_lbk: Loopback) {
    emp_lbk.disconnect();
    emp_lbk.disconnect();
    assert!(!emp_lbk.is_connected());

    let err = emp_lbk.write("*IDN?").unwrap_err();
    assert!(matches!(err, InstrumentError::Disconnected { .. }));
    assert!(err.is_connection_error());
    assert!(emp_lbk.read().is_err());
}

#[rstest]
fn rstrip_removes_trailing_whitespace() {
    let mut inst = crt_lbk(&[], &["VALUE  \t\r\n"]);
    inst.set_rstrip(true).unwrap();
    assert_eq!(inst.read().unwrap(), "VALUE");
}

#[rstest]
fn latin1_encoding() {
    let mut inst = MessageBased::new(
        "loopback",
        LoopbackTransport::new(vec![vec![0xb5, b'A', b'\r', b'\n']], vec![vec![0xb0, b'C', b'\n']]),
        MessagePolicy::default(),
    )
    .unwrap();
    inst.set_encoding("latin-1").unwrap();
    assert_eq!(inst.query("\u{b5}A").unwrap(), "\u{b0}C");
}

#[rstest]
fn invalid_utf8_is_an_encoding_error() {
    let mut inst = MessageBased::new(
        "loopback",
        LoopbackTransport::new(vec![], vec![vec![0xff, b'\n']]),
        MessagePolicy::default(),
    )
    .unwrap();
    let err = inst.read().unwrap_err();
    assert!(matches!(err, InstrumentError::Encoding { .. }));
    assert!(err.is_configuration_error());
}

#[rstest]
fn text_termination_follows_encoding(mut emp_lbk: Loopback) {
    emp_lbk.set_read_termination(Some("\r\n".into())).unwrap();
    emp_lbk
        .set_write_termination(Some(Termination::Bytes(vec![0x03])))
        .unwrap();

    emp_lbk.set_encoding("utf-16-le").unwrap();
    assert_eq!(emp_lbk.policy().read_termination(), Some(&b"\r\0\n\0"[..]));
    assert_eq!(emp_lbk.policy().write_termination(), Some(&[0x03][..]));

    emp_lbk.set_encoding("utf-8").unwrap();
    assert_eq!(emp_lbk.policy().read_termination(), Some(&b"\r\n"[..]));
    assert_eq!(emp_lbk.policy().write_termination(), Some(&[0x03][..]));
}

#[rstest]
fn unknown_encoding_is_rejected(mut emp_lbk: Loopback) {
    let err = emp_lbk.set_encoding("klingon").unwrap_err();
    assert!(err.is_configuration_error());
    assert_eq!(emp_lbk.policy().encoding().name(), "utf-8");
}

#[rstest]
#[case(0)]
#[case(-1)]
fn invalid_max_read_size(mut emp_lbk: Loopback, #[case] size: i64) {
    assert!(emp_lbk.set_max_read_size(size).is_err());
}

#[rstest]
fn negative_or_zero_timeout_blocks_forever(mut emp_lbk: Loopback) {
    emp_lbk.set_timeout(Some(-1.0)).unwrap();
    assert_eq!(emp_lbk.timeout(), None);
    emp_lbk.set_timeout(Some(0.0)).unwrap();
    assert_eq!(emp_lbk.timeout(), None);
    emp_lbk.set_timeout(Some(1.5)).unwrap();
    assert_eq!(emp_lbk.timeout(), Some(Duration::from_millis(1500)));
}

#[rstest]
fn write_ieee_block() {
    let mut expected = b"DATA #18".to_vec();
    expected.extend_from_slice(&1.0f32.to_le_bytes());
    expected.extend_from_slice(&2.0f32.to_le_bytes());
    expected.extend_from_slice(b"\r\n");
    let mut inst = MessageBased::new(
        "loopback",
        LoopbackTransport::new(vec![expected], vec![]),
        MessagePolicy::default(),
    )
    .unwrap();
    inst.write_values("DATA ", &[1.0, 2.0], BlockFormat::Ieee, DataType::default())
        .unwrap();
}

#[rstest]
fn query_ascii_values() {
    let mut inst = crt_lbk(&["CURV?\r\n"], &["1.5,2.5,-3\n"]);
    let values = inst
        .query_values(
            "CURV?",
            BlockFormat::Ascii,
            "<f8".parse().unwrap(),
            Duration::ZERO,
        )
        .unwrap();
    assert_eq!(values, vec![1.5, 2.5, -3.0]);
}

#[rstest]
#[should_panic(expected = "Leftover expected commands found from instrument to host")]
fn unread_reply_panics_on_drop() {
    let mut inst = crt_lbk(&["*IDN?\r\n"], &["Loopback\n"]);
    inst.write("*IDN?").unwrap();
}

#[rstest]
fn boxed_interface() {
    let mut inst: Box<dyn InstrumentInterface> = Box::new(crt_lbk(&["*IDN?\r\n"], &["ID\n"]));
    assert_eq!(inst.address(), "loopback");
    assert_eq!(inst.query("*IDN?").unwrap(), "ID");
}
