//! Control channel throughput demo, client side: drains the message
//! stream produced by `chan_server`.

use std::sync::Arc;

use clap::Parser;

use dmalink_transfer::{Device, Endpoint, PciAddress, Result};

const SERVICE_NAME: &str = "dmalink_chan";
const ITERATIONS: u32 = 1_000_000;

#[derive(Parser, Debug)]
#[command(name = "chan_client", about = "dmalink control channel throughput client")]
struct Cli {
    /// Control channel device PCI address
    #[arg(short = 'p', long = "pci-addr")]
    pci_addr: String,

    /// Message size in bytes
    #[arg(short = 's', long = "msg-size", default_value_t = 1024)]
    msg_size: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    dmalink_transfer::init_logging();

    let addr = PciAddress::parse(&cli.pci_addr)?;
    let device = Device::open(&addr)?;
    let mut ch = Endpoint::new(Arc::clone(&device), None);

    ch.connect(SERVICE_NAME)?;
    dmalink_transfer::send_success(&mut ch)?;

    let mut buf = vec![0_u8; cli.msg_size];
    for _ in 0..ITERATIONS {
        ch.recv_from(&mut buf)?;
    }

    ch.disconnect()
}
