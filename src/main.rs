//! Recovery harness - disrupt operator-managed resources and time their recovery

use clap::Parser;

use operator_recovery::cli::Cli;
use operator_recovery::telemetry::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_format).map_err(|e| anyhow::anyhow!("{}", e))?;

    let all_recovered = cli.run().await.map_err(|e| anyhow::anyhow!("{}", e))?;
    if !all_recovered {
        std::process::exit(1);
    }
    Ok(())
}
