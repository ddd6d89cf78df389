//! Test cases for GPIB devices behind a simulated Prologix GPIB-ETHERNET controller.

use std::{
    io::{BufRead, BufReader, Write},
    net::TcpListener,
    sync::{Arc, Mutex},
    thread,
};

use rstest::*;

use labconnect::{
    ConnectionConfig, InstrumentError, InstrumentInterface, PrologixConnection, PrologixRegistry,
    Properties, address::parse_prologix, connect, connect_prologix,
};

const VERSION: &str = "Prologix GPIB-ETHERNET Controller version 01.06.06.00";

/// A simulated controller that records every line it receives.
struct Controller {
    port: u16,
    lines: Arc<Mutex<Vec<String>>>,
}

impl Controller {
    /// Accept a single connection. Queries are answered with the selected GPIB address.
    fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&lines);
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut selected = String::new();
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap_or(0) > 0 {
                let command = line.trim_end().to_string();
                line.clear();
                recorded.lock().unwrap().push(command.clone());
                if let Some(addr) = command.strip_prefix("++addr ") {
                    selected = addr.to_string();
                } else if command == "++ver" {
                    stream.write_all(format!("{VERSION}\n").as_bytes()).unwrap();
                } else if command.ends_with('?') {
                    stream
                        .write_all(format!("ANSWER {selected}\n").as_bytes())
                        .unwrap();
                }
            }
        });
        Controller { port, lines }
    }

    fn address(&self, gpib: &str) -> String {
        format!("Prologix::127.0.0.1::{}::{gpib}", self.port)
    }

    fn attach(
        &self,
        gpib: &str,
        properties: Properties,
        registry: &PrologixRegistry,
    ) -> PrologixConnection {
        let address = self.address(gpib);
        let parsed = parse_prologix(&address).unwrap();
        connect_prologix(
            &address,
            &parsed,
            &properties.with("timeout", 2.0),
            registry,
        )
        .unwrap()
    }

    fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

#[fixture]
fn controller() -> Controller {
    Controller::spawn()
}

#[rstest]
fn devices_share_one_controller(controller: Controller) {
    let registry = PrologixRegistry::new();
    let mut dmm = controller.attach("5", Properties::new().with("eoi", 1), &registry);
    let mut scope = controller.attach("GPIB::7::96", Properties::new(), &registry);

    assert_eq!(registry.len(), 1);
    assert_eq!(dmm.controller_key(), scope.controller_key());
    assert!(Arc::ptr_eq(&dmm.controller(), &scope.controller()));

    dmm.write("*RST").unwrap();
    assert_eq!(scope.query("*IDN?").unwrap(), "ANSWER 7 96");
    assert_eq!(dmm.version().unwrap(), VERSION);

    assert_eq!(
        controller.lines(),
        vec![
            "++mode 1",
            "++eoi 1",
            "++mode 1",
            "++addr 5",
            "*RST",
            "++addr 7 96",
            "++auto 1",
            "*IDN?",
            "++auto 0",
            "++ver",
        ]
    );
}

#[rstest]
fn every_read_selects_the_device(controller: Controller) {
    let registry = PrologixRegistry::new();
    let mut first = controller.attach("1", Properties::new(), &registry);
    let mut second = controller.attach("2", Properties::new(), &registry);
    first.set_query_auto(false);
    second.set_query_auto(false);
    assert!(!first.query_auto());

    first.write("MEAS?").unwrap();
    assert_eq!(first.read().unwrap(), "ANSWER 1");
    assert_eq!(second.query("MEAS?").unwrap(), "ANSWER 2");
    first.version().unwrap();

    assert_eq!(
        controller.lines(),
        vec![
            "++mode 1", "++mode 1", "++addr 1", "MEAS?", "++addr 1", "++addr 2", "MEAS?",
            "++ver",
        ]
    );
}

#[rstest]
fn disconnect_keeps_controller_open(controller: Controller) {
    let registry = PrologixRegistry::new();
    let mut first = controller.attach("1", Properties::new(), &registry);
    let mut second = controller.attach("2", Properties::new(), &registry);

    first.disconnect();
    first.disconnect();
    let err = first.write("*RST").unwrap_err();
    assert!(matches!(err, InstrumentError::Disconnected { .. }));
    assert_eq!(err.address(), controller.address("1"));

    assert!(second.is_connected());
    assert_eq!(second.query("*IDN?").unwrap(), "ANSWER 2");
    assert_eq!(registry.len(), 1);
}

#[rstest]
fn settings_are_shared(controller: Controller) {
    let registry = PrologixRegistry::new();
    let mut first = controller.attach("1", Properties::new(), &registry);
    let second = controller.attach("2", Properties::new(), &registry);

    first.set_timeout(Some(5.0)).unwrap();
    first.set_rstrip(true).unwrap();
    assert_eq!(second.timeout(), first.timeout());
    assert!(second.policy().rstrip());
}

#[rstest]
fn group_execute_trigger(controller: Controller) {
    let registry = PrologixRegistry::new();
    let mut dev = controller.attach("1", Properties::new(), &registry);

    let too_many: Vec<u8> = (1..=16).collect();
    let err = dev.group_execute_trigger(&too_many).unwrap_err();
    assert!(err.is_configuration_error());

    dev.group_execute_trigger(&[3, 96, 12]).unwrap();
    dev.group_execute_trigger(&[]).unwrap();
    dev.version().unwrap();
    assert_eq!(
        controller.lines(),
        vec!["++mode 1", "++trg 3 96 12", "++trg", "++ver"]
    );
}

#[rstest]
fn boxed_connection_from_config(controller: Controller) {
    let registry = PrologixRegistry::new();
    let config =
        ConnectionConfig::new(&controller.address("GPIB0::9")).with_property("timeout", 2.0);
    let mut inst = connect(&config, &registry).unwrap();
    assert_eq!(inst.query("VOLT?").unwrap(), "ANSWER 9");
    assert_eq!(registry.keys(), vec![format!("127.0.0.1:{}", controller.port)]);
}

#[rstest]
fn query_auto_off_from_config(controller: Controller) {
    let registry = PrologixRegistry::new();
    let config = ConnectionConfig::new(&controller.address("4"))
        .with_property("timeout", 2.0)
        .with_property("query_auto", false);
    let mut inst = connect(&config, &registry).unwrap();
    inst.write("MEAS?").unwrap();
    assert_eq!(inst.read().unwrap(), "ANSWER 4");
    assert_eq!(inst.query("MEAS?").unwrap(), "ANSWER 4");
    inst.disconnect();

    let key = registry.keys().remove(0);
    let shared = registry.get(&key).unwrap();
    shared.lock().unwrap().query("++ver").unwrap();
    assert_eq!(
        controller.lines(),
        vec![
            "++mode 1", "++addr 4", "MEAS?", "++addr 4", "++addr 4", "MEAS?", "++ver",
        ]
    );
}

#[rstest]
#[case("Prologix::127.0.0.1::1234::31")]
#[case("Prologix::127.0.0.1::1234::5::95")]
#[case("Prologix::127.0.0.1::1234::5::127")]
#[case("Prologix::127.0.0.1::1234")]
fn invalid_gpib_address(#[case] address: &str) {
    let registry = PrologixRegistry::new();
    let err = connect(&ConnectionConfig::new(address), &registry).err().unwrap();
    assert!(err.is_configuration_error());
    assert!(registry.is_empty());
}
