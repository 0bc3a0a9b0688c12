use order_pipeline::config::PipelineConfig;
use order_pipeline::intake::{OrderGenerator, OrderIntake};
use order_pipeline::lifecycle::{wait_until_processing, PipelineSystem};
use order_pipeline::model::{AssembleOrder, Part, ShipOrder};
use order_pipeline::{assembly_stage, shipping_stage, PipelineError};
use stage_framework::mock::RecordingErrorHandler;
use stage_framework::{InMemoryBroker, QueueError, StageState};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::MakeWriter;

/// Collects formatted log lines in memory.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn capture_logs(logs: &LogBuffer) -> tracing::subscriber::DefaultGuard {
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::set_default(subscriber)
}

fn test_config() -> PipelineConfig {
    PipelineConfig {
        assembly_work_ms: 100,
        shipping_work_min_ms: 10,
        shipping_work_max_ms: 20,
        receive_wait_ms: 50,
        rng_seed: Some(1),
        ..PipelineConfig::default()
    }
}

fn six_part_order(id: &str) -> AssembleOrder {
    let names = ["frame", "fork", "wheel", "chain", "seat", "brake"];
    let parts = names
        .iter()
        .enumerate()
        .map(|(i, name)| Part::new(format!("{}-part-{}", id, i), *name, "96385074"))
        .collect();
    AssembleOrder::new(id, 2500, "gravel", parts)
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..100_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

fn drained(broker: &InMemoryBroker, queue: &str) -> bool {
    broker.ready_count(queue) == 0 && broker.locked_count(queue) == 0
}

#[tokio::test(start_paused = true)]
async fn test_order_abc123_end_to_end() {
    let logs = LogBuffer::default();
    let _guard = capture_logs(&logs);

    let broker = InMemoryBroker::new("e2e");
    let config = test_config();
    let assembly_queue = config.assembly_queue.clone();
    let shipping_queue = config.shipping_queue.clone();

    // 1. Intake publishes the order.
    let intake = OrderIntake::connect(
        broker.connect(),
        &assembly_queue,
        OrderGenerator::new(config.rng(0)),
    )
    .await
    .unwrap();
    let order = six_part_order("abc123");
    let accepted = intake.submit(&order).await.unwrap();

    let queued = broker.peek(&assembly_queue);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].decode::<AssembleOrder>().unwrap(), order);

    // 2. Assembly turns it into a shipment under the same correlation id.
    let shutdown = CancellationToken::new();
    let (assembly, mut assembly_monitor) = assembly_stage::new(broker.connect(), &config);
    let assembly_handle = tokio::spawn(assembly.run(shutdown.clone()));
    wait_until_processing(assembly_stage::STAGE_NAME, &mut assembly_monitor)
        .await
        .unwrap();

    wait_until(|| broker.ready_count(&shipping_queue) == 1).await;
    let forwarded = broker.peek(&shipping_queue);
    let shipment: ShipOrder = forwarded[0].decode().unwrap();
    assert_eq!(shipment.id, "abc123");
    assert!(!shipment.address.is_empty());
    assert_eq!(forwarded[0].correlation_id, accepted.correlation_id);
    assert_ne!(forwarded[0].message_id, accepted.message_id);
    assert_eq!(forwarded[0].type_tag.as_deref(), Some("ShipOrder"));

    // 3. Shipping consumes it and logs the completion.
    let (shipping, _shipping_monitor) = shipping_stage::new(broker.connect(), &config);
    let shipping_handle = tokio::spawn(shipping.run(shutdown.clone()));
    wait_until(|| drained(&broker, &shipping_queue)).await;

    shutdown.cancel();
    let assembly_stats = assembly_handle.await.unwrap().unwrap();
    let shipping_stats = shipping_handle.await.unwrap().unwrap();
    intake.close().await.unwrap();

    assert_eq!(assembly_stats.forwarded, 1);
    assert_eq!(shipping_stats.processed, 1);
    assert!(drained(&broker, &assembly_queue));

    let output = logs.contents();
    assert!(
        output
            .lines()
            .any(|line| line.contains("Bike shipped") && line.contains("abc123")),
        "no completion log in:\n{}",
        output
    );
}

#[tokio::test(start_paused = true)]
async fn test_pipeline_system_fulfils_random_orders() {
    let broker = InMemoryBroker::new("system");
    let config = test_config();
    let mut system = PipelineSystem::start_with(&config, broker.clone()).await.unwrap();

    for _ in 0..3 {
        system.intake.submit_random().await.unwrap();
    }
    wait_until(|| {
        drained(&broker, &config.assembly_queue) && drained(&broker, &config.shipping_queue)
    })
    .await;

    let report = system.shutdown().await.unwrap();
    assert_eq!(report.assembly.processed, 3);
    assert_eq!(report.assembly.forwarded, 3);
    assert_eq!(report.shipping.processed, 3);
    assert_eq!(report.shipping.dropped, 0);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.creations(&config.assembly_queue), 1);
    assert_eq!(broker.creations(&config.shipping_queue), 1);
}

#[tokio::test]
async fn test_unsupported_connection_string_is_rejected() {
    let config = PipelineConfig {
        connection_string: "amqp://localhost".into(),
        ..test_config()
    };

    let err = PipelineSystem::start(&config).await.err().unwrap();
    assert!(matches!(
        err,
        PipelineError::Queue(QueueError::InvalidConnectionString(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_order_is_dropped_without_blocking_the_next() {
    let broker = InMemoryBroker::new("invalid");
    let config = test_config();
    let intake = OrderIntake::connect(
        broker.connect(),
        &config.assembly_queue,
        OrderGenerator::new(config.rng(0)),
    )
    .await
    .unwrap();

    let mut short = six_part_order("short");
    short.parts.truncate(3);
    intake.submit(&short).await.unwrap();
    intake.submit(&six_part_order("good")).await.unwrap();

    let errors = RecordingErrorHandler::new();
    let (assembly, _monitor) = assembly_stage::new(broker.connect(), &config);
    let assembly = assembly.with_error_handler(errors.clone());
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(assembly.run(shutdown.clone()));

    wait_until(|| drained(&broker, &config.assembly_queue)).await;
    shutdown.cancel();
    let stats = handle.await.unwrap().unwrap();

    assert_eq!(errors.kinds(), vec!["processing"]);
    assert!(errors.errors()[0].message.contains("short"));
    let shipments: Vec<ShipOrder> = broker
        .peek(&config.shipping_queue)
        .iter()
        .map(|envelope| envelope.decode().unwrap())
        .collect();
    assert_eq!(shipments.len(), 1);
    assert_eq!(shipments[0].id, "good");
    assert_eq!(stats.dropped, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_assembly_keeps_the_order() {
    let broker = InMemoryBroker::new("cancel");
    let config = PipelineConfig {
        assembly_work_ms: 60_000,
        ..test_config()
    };
    let intake = OrderIntake::connect(
        broker.connect(),
        &config.assembly_queue,
        OrderGenerator::new(config.rng(0)),
    )
    .await
    .unwrap();
    intake.submit(&six_part_order("abc123")).await.unwrap();
    intake.close().await.unwrap();

    let host = CancellationToken::new();
    let (assembly, mut monitor) = assembly_stage::new(broker.connect(), &config);
    let assembly = assembly.with_host_signal(host.clone());
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(assembly.run(shutdown.clone()));

    wait_until(|| broker.locked_count(&config.assembly_queue) == 1).await;
    shutdown.cancel();
    let stats = handle.await.unwrap().unwrap();

    assert_eq!(monitor.state(), StageState::Stopped);
    assert!(host.is_cancelled());
    assert_eq!(stats.abandoned, 1);
    assert_eq!(broker.ready_count(&config.assembly_queue), 1);
    assert_eq!(broker.ready_count(&config.shipping_queue), 0);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.open_senders(), 0);
    assert_eq!(broker.open_receivers(), 0);
}
