use std::env;
use std::sync::Arc;
use std::time::Duration;

use benchsink_core::bench::BenchOutput;
use benchsink_core::config::OutputConfig;
use benchsink_core::message::Response;
use benchsink_core::metrics::start_metrics_http_server;
use benchsink_core::{Error, Result};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cmdline::BenchArgs;
use crate::generate::{self, GeneratorConfig};

/// Capacity of the upstream queue between the generator and the output.
const UPSTREAM_BUFFER: usize = 1000;

/// Runs the generator against a bench output until the generation duration elapses or a shutdown
/// signal arrives, then waits for the output to close.
pub(crate) async fn run(args: BenchArgs) -> Result<()> {
    let mut config = OutputConfig::load(env::vars())?;
    if let Some(period) = args.period {
        config.report_period = period;
    }

    let output = Arc::new(BenchOutput::bench(config)?);
    let Some(mut acks) = output.acknowledgment_channel() else {
        return Err(Error::Runtime(
            "acknowledgment channel already taken".to_string(),
        ));
    };

    // the metrics server lives as long as the process, its handle is not joined
    let metrics_port = args.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_http_server(("0.0.0.0", metrics_port)).await {
            error!(?e, "Metrics server error");
        }
    });

    let acks_handle = tokio::spawn(async move {
        let (mut succeeded, mut failed) = (0u64, 0u64);
        while let Some(response) = acks.recv().await {
            match response {
                Response::Success => succeeded += 1,
                Response::Failed(_) => failed += 1,
            }
        }
        (succeeded, failed)
    });

    let (messages_tx, messages_rx) = mpsc::channel(UPSTREAM_BUFFER);
    output.start_receiving(messages_rx)?;

    let cln_token = CancellationToken::new();
    let generator = generate::start(
        GeneratorConfig {
            rate: args.rate,
            parts: args.parts,
            size: args.size,
            duration: args.duration,
        },
        messages_tx,
        cln_token.clone(),
    );

    tokio::select! {
        _ = shutdown_signal() => {
            cln_token.cancel();
            output.close_async();
        }
        // the generator closing the upstream queue stops the output on its own
        _ = output.wait_for_close(Duration::MAX) => {}
    }

    if let Err(e) = output.wait_for_close(args.close_timeout).await {
        warn!(?e, timeout = ?args.close_timeout, "Output did not close in time");
        cln_token.cancel();
        return Err(e);
    }
    cln_token.cancel();

    let sent = generator
        .await
        .map_err(|e| Error::Runtime(format!("generator task failed: {e}")))?;
    let (succeeded, failed) = acks_handle
        .await
        .map_err(|e| Error::Runtime(format!("acknowledgment task failed: {e}")))?;

    info!(sent, succeeded, failed, "Benchmark run finished");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(?e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install terminate signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
