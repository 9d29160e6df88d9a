use std::sync::Arc;

use clap::Parser;
use log::info;

use dmalink_transfer::{Capability, Device, Endpoint, MemoryRegion, PciAddress, Result};

/// Control channel name shared with the accelerator side.
const SERVICE_NAME: &str = "dmalink_dma";

#[derive(Parser, Debug)]
#[command(
    name = "dmalink-host",
    about = "dmalink host - exports a memory region for accelerator-driven DMA"
)]
pub struct Cli {
    /// Control channel device PCI address
    #[arg(short = 'p', long = "pci-addr")]
    pub pci_addr: String,

    /// Device representor PCI address (needed only on the accelerator side)
    #[arg(short = 'r', long = "rep-pci")]
    pub rep_pci: Option<String>,

    /// DMA chunk size in bytes
    #[arg(short = 's', long = "chunk-size", default_value_t = 4096)]
    pub chunk_size: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Initialize logging with the specified log level
fn init_logging(level: &str) {
    use logforth::append;
    use logforth::filter::EnvFilter;
    use logforth::layout::TextLayout;

    let filter = match level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        _ => {
            eprintln!("Invalid log level: {}, defaulting to info", level);
            "info"
        }
    };

    logforth::builder()
        .dispatch(|d| {
            d.filter(EnvFilter::from(filter))
                .append(append::Stderr::default().with_layout(TextLayout::default().no_color()))
        })
        .apply();
}

/// Run the host side: connect, export the region, hand the range to
/// the accelerator and wait for the transfer to finish.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let cc_addr = PciAddress::parse(&cli.pci_addr)?;
    let cc_device = Device::open(&cc_addr)?;
    let mut ch = Endpoint::new(Arc::clone(&cc_device), None);

    ch.connect(SERVICE_NAME)?;
    dmalink_transfer::send_success(&mut ch)?;

    let dma_device = Device::open_with_capability(Capability::DmaMemcpy)?;
    let region = MemoryRegion::alloc(cli.chunk_size)?;

    dmalink_transfer::publish_region(&mut ch, &region, &dma_device)?;
    dmalink_transfer::send_range(&mut ch, &region)?;

    dmalink_transfer::wait_for_success(&mut ch)?;
    info!("final status received, transfer finished");

    ch.disconnect()?;
    Ok(())
}
