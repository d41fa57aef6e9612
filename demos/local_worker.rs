use relayq::prelude::*;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> RelayResult<()> {
    let mut config = RelayConfig::development();
    config.worker.retry = RetryPolicy::exponential(2).with_base_delay(250);
    relayq::logging::init_tracing(&config.logging)?;

    // Odd years fail on every attempt and end up in the dead-letter queue
    let executors = ExecutorRegistry::new().register(
        "sales_report",
        FnExecutor::new(|request: ExecutionRequest| async move {
            let year = request
                .params
                .get("year")
                .and_then(|year| year.as_u64())
                .ok_or_else(|| ExecutionError::fatal("missing parameter 'year'"))?;

            tokio::time::sleep(Duration::from_millis(200)).await;
            if year % 2 == 1 {
                return Err(ExecutionError::failed(format!("no data for {year}")));
            }
            Ok::<_, ExecutionError>(OutputDescriptor::new("json", format!("/reports/{year}.json")))
        }),
    );

    let broker = InMemoryBroker::new();
    let worker = Arc::new(RelayWorker::new(
        config,
        Arc::new(broker.clone()),
        Arc::new(InMemoryTaskStore::new()),
        Arc::new(executors),
    ));

    let running = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run_until_signal().await })
    };
    while !broker.queue_exists(&worker.config().queues.work_queue) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let client = worker.client();
    let requests = (2020..2025).map(|year| {
        let mut params = TaskParams::new();
        params.insert("year".to_string(), year.into());
        TaskRequest::new("sales_report", params)
    });
    let ids = client.submit_batch(requests).await?;
    println!("Submitted {} tasks, press Ctrl+C to stop early", ids.len());

    for id in &ids {
        loop {
            match client.status(id).await? {
                Some(record) if record.status.is_terminal() => {
                    println!(
                        "{} {} retries={} output={:?} error={:?}",
                        record.id,
                        record.status,
                        record.retry_count,
                        record.output.map(|output| output.location),
                        record.error
                    );
                    break;
                }
                _ => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    }

    println!("{:?}", worker.stats());
    worker.shutdown();
    running
        .await
        .map_err(|e| RelayError::config(format!("worker task failed: {e}")))?
}
