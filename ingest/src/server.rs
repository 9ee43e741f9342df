use std::future::Future;
use std::sync::Arc;

use ingest_common::time::SystemTime;
use tokio::net::TcpListener;

use crate::batch::BatchAccumulator;
use crate::config::Config;
use crate::normalizer::PhoneNormalizer;
use crate::router;
use crate::sampler::Sampler;
use crate::sinks::{insert_all::InsertAllSink, print::PrintSink, Sink};
use crate::writer::SinkWriter;

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let sink: Arc<dyn Sink + Send + Sync> = if config.print_sink {
        Arc::new(PrintSink {})
    } else {
        Arc::new(InsertAllSink::new(&config.sink).expect("failed to create sink"))
    };

    let accumulator = BatchAccumulator::new(
        SinkWriter::new(sink),
        config.batch.batch_max_size,
        config.batch.batch_max_wait_ms.0,
    );

    let app = router::router(
        SystemTime {},
        accumulator.clone(),
        Sampler::new(config.sampling_rate),
        PhoneNormalizer::from_config(&config.normalize),
        config.ingest_wait_timeout_ms.0,
        config.export_prometheus,
    );

    tracing::info!(
        "listening on {:?}",
        listener.local_addr().expect("could not get local address")
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("failed to start serving ingest");

    // Requests are drained, write whatever is still buffered
    accumulator.shutdown().await;
}
