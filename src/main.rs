use anyhow::Result;
use tracing::{error, info};

use crawl_orchestrator::cli;
use crawl_orchestrator::utils::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args();
    init_logging(args.verbose, args.log_file())?;

    info!("Starting crawl-orchestrator v{}", env!("CARGO_PKG_VERSION"));

    match cli::process_command(args).await {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
