//! Event pipeline: queue consumption, worker fan-out, shutdown drain
//!
//! Consumes raw frames from the session queue, normalizes and filters
//! them on a bounded worker pool, and hands kept events to the forwarder.
//! Global arrival order is not preserved across workers; per-entity
//! ordering is delegated to the broker partition key. On shutdown the
//! pool drains in-flight work within a grace window and counts whatever
//! was still queued as dropped.

use crate::config::PipelineConfig;
use crate::filter::{FilterDecision, FilterEngine};
use crate::forwarder::Forwarder;
use crate::metrics::{MetricsAggregator, ProcessingTimer};
use crate::normalizer::normalize;
use crate::session::connection::wait_for_shutdown;
use crate::session::InboundEvent;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;

/// Runs the normalize/filter/forward stages over the inbound queue
pub struct EventPipeline {
    config: PipelineConfig,
    engine: Arc<FilterEngine>,
    forwarder: Arc<Forwarder>,
    metrics: Arc<MetricsAggregator>,
}

impl EventPipeline {
    pub fn new(
        config: PipelineConfig,
        engine: Arc<FilterEngine>,
        forwarder: Arc<Forwarder>,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            config,
            engine,
            forwarder,
            metrics,
        }
    }

    /// Run the pipeline until the queue closes or shutdown is requested
    ///
    /// Each frame is processed on its own spawned task, with at most
    /// `worker_pool_size` tasks in flight. Returns once every accepted
    /// frame is handled, or once the shutdown grace window expires;
    /// frames still queued at that point are counted as dropped.
    pub async fn run(self, events: mpsc::Receiver<InboundEvent>, mut shutdown: watch::Receiver<bool>) {
        let Self {
            config,
            engine,
            forwarder,
            metrics,
        } = self;
        let workers = config.effective_worker_pool_size();
        let grace = config.shutdown_grace();
        info!("Event pipeline started with {} workers", workers);

        let mut source = ReceiverStream::new(events);
        {
            let worker_metrics = Arc::clone(&metrics);
            let mut tasks = (&mut source)
                .map(move |inbound| {
                    tokio::spawn(process_event(
                        Arc::clone(&engine),
                        Arc::clone(&forwarder),
                        Arc::clone(&worker_metrics),
                        inbound,
                    ))
                })
                .buffer_unordered(workers);

            let interrupted = loop {
                tokio::select! {
                    next = tasks.next() => match next {
                        Some(Ok(())) => {}
                        Some(Err(err)) => error!("Event worker panicked: {}", err),
                        None => break false,
                    },
                    _ = wait_for_shutdown(&mut shutdown) => break true,
                }
            };

            if interrupted {
                info!(
                    "Shutdown requested, draining in-flight events for up to {:?}",
                    grace
                );
                let drained = timeout(grace, async {
                    while let Some(result) = tasks.next().await {
                        if let Err(err) = result {
                            error!("Event worker panicked: {}", err);
                        }
                    }
                })
                .await;
                if drained.is_err() {
                    warn!("Shutdown grace of {:?} expired before the queue drained", grace);
                }
            }
        }

        source.close();
        let mut receiver = source.into_inner();
        let mut abandoned = 0u64;
        while receiver.try_recv().is_ok() {
            abandoned += 1;
        }
        if abandoned > 0 {
            metrics.record_dropped_on_shutdown(abandoned);
            warn!("Abandoned {} queued events on shutdown", abandoned);
        }
        info!("Event pipeline stopped");
    }
}

/// Process one raw frame through normalize, filter and forward
///
/// The processing-time sample covers normalize plus the filter decision;
/// forwarding latency is the broker's problem, not the pipeline's.
async fn process_event(
    engine: Arc<FilterEngine>,
    forwarder: Arc<Forwarder>,
    metrics: Arc<MetricsAggregator>,
    inbound: InboundEvent,
) {
    let timer = ProcessingTimer::start(Arc::clone(&metrics));
    let Some(event) = normalize(&inbound.payload, inbound.received_at) else {
        metrics.record_parse_failure();
        return;
    };
    match engine.evaluate(&event) {
        FilterDecision::Keep(_) => {
            timer.finish();
            if let Err(err) = forwarder.forward(&event).await {
                debug!("Event {} lost to the broker: {}", event.id, err);
            }
        }
        FilterDecision::Drop(_) => {
            timer.finish();
            metrics.record_filtered();
        }
    }
}
