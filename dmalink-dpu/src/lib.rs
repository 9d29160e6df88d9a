use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use log::info;

use dmalink_transfer::{
    Capability, Device, DeviceRep, Endpoint, MemoryRegion, Orchestrator, PciAddress, Result,
};

/// Control channel name shared with the host side.
const SERVICE_NAME: &str = "dmalink_dma";

#[derive(Parser, Debug)]
#[command(
    name = "dmalink-dpu",
    about = "dmalink accelerator - imports the host region and drives the DMA copy loop"
)]
pub struct Cli {
    /// Control channel device PCI address
    #[arg(short = 'p', long = "pci-addr")]
    pub pci_addr: String,

    /// Device representor PCI address
    #[arg(short = 'r', long = "rep-pci")]
    pub rep_pci: String,

    /// DMA chunk size in bytes
    #[arg(short = 's', long = "chunk-size", default_value_t = 4096)]
    pub chunk_size: usize,

    /// Number of copy jobs to run
    #[arg(long, default_value_t = 100_000)]
    pub iterations: u32,

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

/// Run the accelerator side: accept the host, import its region and
/// drive the copy loop, reporting throughput at the end.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let cc_addr = PciAddress::parse(&cli.pci_addr)?;
    let rep_addr = PciAddress::parse(&cli.rep_pci)?;
    let cc_device = Device::open(&cc_addr)?;
    let rep = DeviceRep::open(&cc_device, &rep_addr)?;
    let mut ch = Endpoint::new(Arc::clone(&cc_device), Some(rep));

    ch.listen(SERVICE_NAME)?;
    dmalink_transfer::wait_for_success(&mut ch)?;

    let dma_device = Device::open_with_capability(Capability::DmaMemcpy)?;
    let mut orchestrator = Orchestrator::new(Arc::clone(&dma_device))?;

    let mut local = MemoryRegion::alloc(cli.chunk_size)?;
    local.as_mut_slice().fill(42);

    let mut remote = dmalink_transfer::receive_region(&mut ch, &dma_device)?;
    dmalink_transfer::recv_range(&mut ch, &mut remote)?;

    let session = orchestrator.begin_session(&local, &remote)?;

    let started_at = Instant::now();
    for _ in 0..cli.iterations {
        if let Err(error) = orchestrator.copy(&session, cli.chunk_size) {
            let _ = dmalink_transfer::send_failure(&mut ch);
            orchestrator.end_session(session);
            return Err(error);
        }
    }
    let elapsed = started_at.elapsed();

    dmalink_transfer::send_success(&mut ch)?;

    let elapsed_secs = elapsed.as_secs_f64();
    if elapsed_secs > 0.0 {
        let total_bytes = cli.chunk_size as f64 * cli.iterations as f64;
        info!(
            "throughput: bytes={}, jobs={}, elapsed_ms={:.3}, bw={:.3} MB/s",
            total_bytes, cli.iterations, elapsed_secs * 1000.0, total_bytes / elapsed_secs / 1e6
        );
    }

    orchestrator.end_session(session);
    ch.disconnect()?;
    Ok(())
}
