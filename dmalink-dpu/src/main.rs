use std::process;

fn main() {
    if let Err(e) = dmalink_dpu::run() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
