use anyhow::Result;
use clap::Parser;

use filerelay::cli::MonCli;
use filerelay::monitor;
use filerelay::util;

fn main() -> Result<()> {
    let cli = MonCli::parse();
    let work_dir = match &cli.work_dir {
        Some(d) => d.clone(),
        None => std::env::current_dir()?,
    };
    if let Some(pos) = cli.peer_poll {
        util::init_tracing(&work_dir, &format!("fr-mon-peer-{}", pos), cli.debug);
        return monitor::run_peer_poll(&work_dir, pos);
    }
    if let Some(pos) = cli.log_fetch {
        util::init_tracing(&work_dir, &format!("fr-mon-log-{}", pos), cli.debug);
        let code = monitor::run_log_fetch(&work_dir, pos)?;
        std::process::exit(code);
    }
    util::init_tracing(&work_dir, "fr-mon", cli.debug);
    let mut supervisor = monitor::Supervisor::new(&work_dir)?;
    supervisor.run()
}
