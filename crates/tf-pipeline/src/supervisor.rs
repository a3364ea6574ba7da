//! Drains every stage's fault stream in one task.
//!
//! Every fault is logged. Under [`ErrorPolicy::HaltOnFatal`] the first fatal
//! fault requests a stop on the halt notifier. Once every fault stream has
//! closed, meaning every stage has finished, the notifier is marked stopped.

use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use tf_core::config::ErrorPolicy;
use tf_core::error::StageFault;
use tf_core::stage::FaultReceiver;
use tf_core::stop::StopNotifier;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Fault counts seen over a supervisor's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultSummary {
    pub recoverable: usize,
    pub fatal: usize,
}

/// Spawn the supervisor. The handle resolves once every fault stream has closed.
pub fn spawn_supervisor(faults: Vec<FaultReceiver>, policy: ErrorPolicy, halt: StopNotifier) -> JoinHandle<FaultSummary> {
    let streams: Vec<BoxStream<'static, StageFault>> = faults
        .into_iter()
        .map(|mut rx| stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
        .collect();

    tokio::spawn(async move {
        let mut merged = stream::select_all(streams);
        let mut summary = FaultSummary::default();

        while let Some(fault) = merged.next().await {
            if !fault.is_fatal() {
                summary.recoverable += 1;
                warn!(stage = %fault.stage, "recoverable fault: {}", fault.error);
                continue;
            }

            summary.fatal += 1;
            error!(stage = %fault.stage, "fatal fault: {}", fault.error);
            if policy == ErrorPolicy::HaltOnFatal && halt.request_stop() {
                warn!("halting pipeline after fatal fault in {}", fault.stage);
            }
        }

        info!(
            recoverable = summary.recoverable,
            fatal = summary.fatal,
            "all stages finished"
        );
        halt.notify_stop();
        summary
    })
}
