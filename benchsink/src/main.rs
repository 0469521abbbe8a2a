use std::error::Error;

use tracing::{error, info};

mod cmdline;
mod driver;
mod generate;
mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = cmdline::root_cli().get_matches();

    match cli.subcommand() {
        Some(("bench", args)) => {
            let args = cmdline::BenchArgs::from(args);
            info!(?args, "Starting benchmark");
            driver::run(args)
                .await
                .map_err(|e| format!("Error running benchmark: {e:?}"))?;
        }
        other => {
            return Err(format!("unsupported subcommand {:?}", other.map(|(name, _)| name)).into());
        }
    }

    Ok(())
}
