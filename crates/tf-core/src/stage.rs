//! The stage contract every pipeline participant implements.
//!
//! # Lifecycle
//!
//! 1. Construct the stage. Its output stream is created here and owned by
//!    the stage.
//! 2. Wire upstream receivers (`set_input` and friends) and hand the output
//!    receiver to the next stage via [`Stage::take_output`].
//! 3. Call [`Stage::execute`]: spawns the worker task and returns at once.
//! 4. Call [`Stage::close`]: requests a cooperative stop and waits until the
//!    worker task has exited.
//!
//! # Channel ownership
//!
//! A stage is the only writer of its output stream. The stream is closed by
//! dropping the [`PacketSender`], which only ever happens when the stage's
//! worker loop ends (or in `close()` when the stage never ran). Consumers hold
//! receivers and so cannot close a stream they read from.

use std::any::Any;
use std::future::Future;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, warn};

use crate::error::{StageError, StageFault};
use crate::stop::StopNotifier;
use crate::types::{Packet, PayloadKind};

/// Slots per data stream. One is the smallest tokio allows, so every send
/// waits for the consumer to take the previous packet.
pub const STREAM_CAPACITY: usize = 1;

pub type PacketSender = mpsc::Sender<Packet>;
pub type PacketReceiver = mpsc::Receiver<Packet>;

/// Sender half of a fault stream.
pub type FaultSender = mpsc::UnboundedSender<StageFault>;

/// Receiver half of a fault stream. Unbounded so that a fault stream nobody
/// reads never stalls a data path.
pub type FaultReceiver = mpsc::UnboundedReceiver<StageFault>;

/// Create a data stream.
pub fn stream() -> (PacketSender, PacketReceiver) {
    mpsc::channel(STREAM_CAPACITY)
}

/// Create a fault stream.
pub fn fault_stream() -> (FaultSender, FaultReceiver) {
    mpsc::unbounded_channel()
}

/// Lifecycle shared by all stages.
///
/// Only `Send` is required: the orchestrator drives stages one at a time.
#[async_trait]
pub trait Stage: Send {
    /// Human-readable stage name, used in logs and errors.
    fn name(&self) -> &str;

    /// Payload kind emitted on the output stream, `None` for sinks.
    fn output_kind(&self) -> Option<PayloadKind>;

    /// Hand out the output stream. Returns `Some` once; sinks return `None`,
    /// as do fan-out stages that register consumers through their own method.
    fn take_output(&mut self) -> Option<PacketReceiver>;

    /// Hand out the fault stream, if the stage reports runtime faults.
    fn take_faults(&mut self) -> Option<FaultReceiver> {
        None
    }

    /// Spawn the worker task and return immediately.
    fn execute(&mut self) -> Result<(), StageError>;

    /// Request a stop and wait for the worker task to exit.
    ///
    /// Must be safe to call whether or not `execute` ran, and more than once.
    async fn close(&mut self) -> Result<(), StageError>;
}

/// A stage fed by exactly one upstream stream.
pub trait Downstream: Stage {
    /// Payload kind this stage accepts.
    fn input_kind(&self) -> PayloadKind;

    /// Wire the upstream stream. Must happen before `execute`.
    fn set_input(&mut self, input: PacketReceiver) -> Result<(), StageError>;
}

// ---------------------------------------------------------------------------
// StageWorker: spawn / stop / join bookkeeping
// ---------------------------------------------------------------------------

/// Owns a stage's [`StopNotifier`] and worker task.
///
/// The notifier is marked `Stopped` when the task exits for any reason,
/// including a panic, so observers of [`StopNotifier::done`] never hang on a
/// dead worker.
#[derive(Debug)]
pub struct StageWorker {
    name: String,
    stop: StopNotifier,
    task: Option<JoinHandle<()>>,
    executed: bool,
}

impl StageWorker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stop: StopNotifier::new(),
            task: None,
            executed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A handle on this worker's stop signal.
    pub fn stop_notifier(&self) -> StopNotifier {
        self.stop.clone()
    }

    pub fn is_executed(&self) -> bool {
        self.executed
    }

    /// Fails with [`StageError::AlreadyExecuted`] once the worker has been
    /// spawned. Used to reject wiring after `execute`.
    pub fn ensure_not_executed(&self) -> Result<(), StageError> {
        if self.executed {
            Err(StageError::AlreadyExecuted)
        } else {
            Ok(())
        }
    }

    /// Spawn `work` on the tokio runtime. Can only be called once.
    pub fn spawn<F>(&mut self, work: F) -> Result<(), StageError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.ensure_not_executed()?;
        self.executed = true;

        let stop = self.stop.clone();
        let name = self.name.clone();
        self.task = Some(tokio::spawn(async move {
            let _exit = ExitGuard(stop);
            debug!("[{name}] worker started");
            work.await;
            debug!("[{name}] worker exited");
        }));
        Ok(())
    }

    /// Request a stop and wait for the worker task to finish.
    pub async fn close(&mut self) -> Result<(), StageError> {
        self.stop.request_stop();

        let result = match self.task.take() {
            Some(task) => task.await.map_err(|e| join_failure(&self.name, e)),
            None => Ok(()),
        };

        self.stop.notify_stop();
        result
    }
}

/// Marks the notifier stopped when the worker future is dropped.
struct ExitGuard(StopNotifier);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.notify_stop();
    }
}

fn join_failure(name: &str, e: JoinError) -> StageError {
    if e.is_panic() {
        let msg = panic_message(e.into_panic());
        error!("[{name}] worker panicked: {msg}");
        StageError::Panicked(msg)
    } else {
        warn!("[{name}] worker cancelled: {e}");
        StageError::Cancelled(e.to_string())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Stop-aware stream helpers
// ---------------------------------------------------------------------------

/// Receive the next packet, or `None` if the stream closed or a stop was
/// requested first.
pub async fn recv_or_stop(input: &mut PacketReceiver, stop: &StopNotifier) -> Option<Packet> {
    tokio::select! {
        biased;
        _ = stop.requested() => None,
        packet = input.recv() => packet,
    }
}

/// Run `fut` unless a stop is requested first, in which case `None`.
pub async fn until_stopped<F: Future>(stop: &StopNotifier, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = stop.requested() => None,
        out = fut => Some(out),
    }
}

/// Send a packet downstream. Returns `false` if a stop was requested first or
/// the consumer is gone; either way the caller should wind down.
pub async fn send_or_stop(output: &PacketSender, packet: Packet, stop: &StopNotifier) -> bool {
    tokio::select! {
        biased;
        _ = stop.requested() => false,
        sent = output.send(packet) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::stop::StopState;
    use crate::types::Payload;

    #[tokio::test]
    async fn close_without_execute_is_ok() {
        let mut worker = StageWorker::new("idle");
        worker.close().await.unwrap();
        worker.close().await.unwrap();
        assert!(worker.stop_notifier().is_stopped());
    }

    #[tokio::test]
    async fn close_waits_for_worker_exit() {
        let mut worker = StageWorker::new("loop");
        let stop = worker.stop_notifier();
        let (tx, mut rx) = stream();

        worker
            .spawn(async move {
                let mut seq = 0;
                while send_or_stop(&tx, Packet::new(seq, Payload::Value(0.0)), &stop).await {
                    seq += 1;
                }
            })
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().sequence, 0);
        worker.close().await.unwrap();

        assert_eq!(worker.stop_notifier().state(), StopState::Stopped);
        // Worker dropped its sender on exit; drain whatever was in flight.
        while rx.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn spawn_twice_is_rejected() {
        let mut worker = StageWorker::new("twice");
        worker.spawn(async {}).unwrap();
        assert_eq!(worker.spawn(async {}), Err(StageError::AlreadyExecuted));
        worker.close().await.unwrap();
    }

    #[tokio::test]
    async fn panicking_worker_is_reported() {
        let mut worker = StageWorker::new("boom");
        worker.spawn(async { panic!("kaboom") }).unwrap();
        let err = worker.close().await.unwrap_err();
        assert_eq!(err, StageError::Panicked("kaboom".into()));
        assert!(worker.stop_notifier().is_stopped());
    }

    #[tokio::test]
    async fn cancelled_worker_is_not_a_panic() {
        let task = tokio::spawn(std::future::pending::<()>());
        task.abort();
        let err = task.await.unwrap_err();
        assert!(matches!(join_failure("gone", err), StageError::Cancelled(_)));
    }

    #[tokio::test]
    async fn recv_or_stop_observes_stop() {
        let stop = StopNotifier::new();
        let (_tx, mut rx) = stream();
        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { recv_or_stop(&mut rx, &stop).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        stop.request_stop();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(got.is_none());
    }
}
