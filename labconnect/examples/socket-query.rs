use std::env;

use tracing_subscriber::EnvFilter;

use labconnect::{ConnectionConfig, InstrumentInterface};

fn main() {
    // Show the log messages of labconnect, e.g., with `RUST_LOG=labconnect=debug`.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // The address and the message can be given on the command line.
    let mut args = env::args().skip(1);
    let address = args
        .next()
        .unwrap_or_else(|| "TCP::192.168.1.10::5025".to_string());
    let message = args.next().unwrap_or_else(|| "*IDN?".to_string());

    // Describe the connection, then open it.
    let config = ConnectionConfig::new(&address)
        .with_property("timeout", 5.0)
        .with_property("rstrip", true);
    let mut inst = config.connect().expect("Instrument must be available.");

    // Query the instrument and print the reply.
    println!("{message} -> {}", inst.query(&message).unwrap());

    inst.disconnect();
}
