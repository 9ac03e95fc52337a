use clap::Parser;

use filerelay::cli::WorkerCli;
use filerelay::worker;

fn main() {
    let cli = WorkerCli::parse();
    std::process::exit(worker::run_fetch(&cli));
}
