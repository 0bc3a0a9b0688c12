use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::intake::{OrderGenerator, OrderIntake};
use crate::{assembly_stage, shipping_stage};
use stage_framework::{InMemoryBroker, StageError, StageMonitor, StageState, StageStats};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Random stream the intake generates orders from.
const INTAKE_RNG_STREAM: u64 = 0;

type StageHandle = JoinHandle<Result<StageStats, StageError>>;

/// Runs the whole pipeline in this process: both stages plus the intake.
///
/// All stages share one cancellation token. It is both the shutdown signal
/// and the host signal, so one stage stopping brings the others down too.
///
/// # Example
///
/// ```ignore
/// let mut system = PipelineSystem::start(&PipelineConfig::load()?).await?;
/// system.intake.submit_random().await?;
///
/// let report = system.shutdown().await?;
/// ```
pub struct PipelineSystem {
    /// Publishes orders to the assembly queue.
    pub intake: OrderIntake,
    broker: InMemoryBroker,
    shutdown: CancellationToken,
    stages: Vec<(&'static str, StageHandle)>,
}

/// Final counters of every stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub assembly: StageStats,
    pub shipping: StageStats,
}

impl PipelineSystem {
    /// Connects to the broker named by `config.connection_string` and starts.
    pub async fn start(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let broker = InMemoryBroker::from_connection_string(&config.connection_string)?;
        Self::start_with(config, broker).await
    }

    /// Starts both stages on `broker` and waits until they are processing.
    ///
    /// If a stage fails to start, the other is stopped and the startup error
    /// is returned.
    pub async fn start_with(
        config: &PipelineConfig,
        broker: InMemoryBroker,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let shutdown = CancellationToken::new();

        let (assembly, assembly_monitor) = assembly_stage::new(broker.connect(), config);
        let (shipping, shipping_monitor) = shipping_stage::new(broker.connect(), config);

        let stages = vec![
            (
                assembly_stage::STAGE_NAME,
                tokio::spawn(
                    assembly
                        .with_host_signal(shutdown.clone())
                        .run(shutdown.clone()),
                ),
            ),
            (
                shipping_stage::STAGE_NAME,
                tokio::spawn(
                    shipping
                        .with_host_signal(shutdown.clone())
                        .run(shutdown.clone()),
                ),
            ),
        ];
        let monitors = [
            (assembly_stage::STAGE_NAME, assembly_monitor),
            (shipping_stage::STAGE_NAME, shipping_monitor),
        ];

        for (stage, mut monitor) in monitors {
            if let Err(not_started) = wait_until_processing(stage, &mut monitor).await {
                error!(stage, "Stage failed to start");
                shutdown.cancel();
                return Err(Self::startup_error(not_started, stages).await);
            }
        }

        let generator = OrderGenerator::new(config.rng(INTAKE_RNG_STREAM));
        let connected =
            OrderIntake::connect(broker.connect(), &config.assembly_queue, generator).await;
        let intake = match connected {
            Ok(intake) => intake,
            Err(e) => {
                shutdown.cancel();
                Self::join(stages).await?;
                return Err(e.into());
            }
        };

        info!(
            assembly_queue = %config.assembly_queue,
            shipping_queue = %config.shipping_queue,
            "Pipeline started"
        );
        Ok(Self {
            intake,
            broker,
            shutdown,
            stages,
        })
    }

    /// Cancelled once shutdown begins, including when a stage stops on its own.
    pub fn stopped(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    /// Stops every stage, lets in-flight messages settle, and returns the
    /// stages' final counters.
    pub async fn shutdown(self) -> Result<PipelineReport, PipelineError> {
        info!("Shutting down pipeline...");
        self.shutdown.cancel();
        let closed = self.intake.close().await;

        let report = Self::join(self.stages).await?;
        closed?;
        info!(?report, "Pipeline shutdown complete.");
        Ok(report)
    }

    /// Awaits every stage task, even after one of them failed, and returns
    /// the first failure.
    async fn join(
        stages: Vec<(&'static str, StageHandle)>,
    ) -> Result<PipelineReport, PipelineError> {
        let mut report = PipelineReport::default();
        let mut failure = None;
        for (stage, handle) in stages {
            let stats = match handle.await {
                Ok(Ok(stats)) => stats,
                Ok(Err(e)) => {
                    error!(stage, error = %e, "Stage failed");
                    failure.get_or_insert(PipelineError::Stage(e));
                    continue;
                }
                Err(e) => {
                    error!(stage, "Stage task failed: {:?}", e);
                    failure.get_or_insert(PipelineError::TaskJoin(e.to_string()));
                    continue;
                }
            };
            match stage {
                assembly_stage::STAGE_NAME => report.assembly = stats,
                shipping_stage::STAGE_NAME => report.shipping = stats,
                other => warn!(stage = other, "Unknown stage in report"),
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Waits for every stage task and returns the first error one of them
    /// reported, or `not_started` if none did.
    async fn startup_error(
        not_started: PipelineError,
        stages: Vec<(&'static str, StageHandle)>,
    ) -> PipelineError {
        Self::join(stages).await.err().unwrap_or(not_started)
    }
}

/// Waits until the stage behind `monitor` is processing; any terminal state
/// it reaches first is an error.
pub async fn wait_until_processing(
    stage: &'static str,
    monitor: &mut StageMonitor,
) -> Result<(), PipelineError> {
    match monitor.wait_for(StageState::Processing).await {
        StageState::Processing => Ok(()),
        state => Err(PipelineError::NotStarted { stage, state }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_join_awaits_every_stage_after_a_failure() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let stages: Vec<(&'static str, StageHandle)> = vec![
            (
                assembly_stage::STAGE_NAME,
                tokio::spawn(async { Err(StageError::Serialization("broken".into())) }),
            ),
            (
                shipping_stage::STAGE_NAME,
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(StageStats::default())
                }),
            ),
        ];

        let err = PipelineSystem::join(stages).await.unwrap_err();

        assert!(matches!(err, PipelineError::Stage(StageError::Serialization(_))));
        assert!(finished.load(Ordering::SeqCst));
    }
}
