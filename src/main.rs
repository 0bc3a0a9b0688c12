//! # Order Pipeline Demo
//!
//! Starts the assembly and shipping stages on an in-process broker, buys a few
//! random bikes, then runs until Ctrl-C (or until a stage stops on its own).
//!
//! ```bash
//! RUST_LOG=info cargo run
//! PIPELINE__DEMO_ORDERS=10 PIPELINE__ASSEMBLY_WORK_MS=500 RUST_LOG=info cargo run
//! ```

use order_pipeline::config::PipelineConfig;
use order_pipeline::lifecycle::{setup_tracing, PipelineSystem};
use order_pipeline::PipelineError;
use tracing::{error, info, info_span, warn, Instrument};

#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    setup_tracing();

    let config = PipelineConfig::load()?;
    info!(?config, "Starting order pipeline");

    let mut system = PipelineSystem::start(&config).await?;

    let span = info_span!("intake");
    let submitted = async {
        for _ in 0..config.demo_orders {
            let accepted = system.intake.submit_random().await?;
            info!(order_id = %accepted.order_id, "Order accepted");
        }
        Ok::<(), PipelineError>(())
    }
    .instrument(span)
    .await;

    if let Err(e) = submitted {
        error!("Failed to submit demo orders: {}", e);
        system.shutdown().await?;
        return Err(e);
    }

    let stopped = system.stopped();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("Ctrl-C received"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        },
        _ = stopped.cancelled() => warn!("A stage stopped, shutting down"),
    }

    let report = system.shutdown().await?;
    info!(
        assembled = report.assembly.processed,
        shipped = report.shipping.processed,
        "Done"
    );
    Ok(())
}
