//! Control channel throughput demo, server side: streams fixed-size
//! messages to the connected client and reports MB/s.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use log::info;

use dmalink_transfer::{Device, DeviceRep, Endpoint, PciAddress, Result};

const SERVICE_NAME: &str = "dmalink_chan";
const ITERATIONS: u32 = 1_000_000;

#[derive(Parser, Debug)]
#[command(name = "chan_server", about = "dmalink control channel throughput server")]
struct Cli {
    /// Control channel device PCI address
    #[arg(short = 'p', long = "pci-addr")]
    pci_addr: String,

    /// Device representor PCI address
    #[arg(short = 'r', long = "rep-pci")]
    rep_pci: Option<String>,

    /// Message size in bytes
    #[arg(short = 's', long = "msg-size", default_value_t = 1024)]
    msg_size: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    dmalink_transfer::init_logging();

    let addr = PciAddress::parse(&cli.pci_addr)?;
    let device = Device::open(&addr)?;
    let rep = match &cli.rep_pci {
        Some(rep) => Some(DeviceRep::open(&device, &PciAddress::parse(rep)?)?),
        None => None,
    };
    let mut ch = Endpoint::new(Arc::clone(&device), rep);

    ch.listen(SERVICE_NAME)?;
    dmalink_transfer::wait_for_success(&mut ch)?;

    let buf = vec![0_u8; cli.msg_size];
    let started_at = Instant::now();
    for _ in 0..ITERATIONS {
        ch.send_to(&buf)?;
    }
    let elapsed_secs = started_at.elapsed().as_secs_f64();
    if elapsed_secs > 0.0 {
        let total_bytes = cli.msg_size as f64 * ITERATIONS as f64;
        info!("throughput: {:.3} MB/s", total_bytes / elapsed_secs / 1e6);
    }

    ch.disconnect()
}
