//! # Trigger intake.
//!
//! [`TriggerHandle`] is the sending side of the control loop's bounded FIFO
//! queue. Clones share the queue.

use tokio::sync::mpsc;

use crate::error::SignalError;
use crate::workflow::TriggerRequest;

/// Name of the trigger channel.
pub const SIGNAL_CHANNEL: &str = "PreemptVMsChan";

/// Sends [`TriggerRequest`]s to the control loop.
#[derive(Clone, Debug)]
pub struct TriggerHandle {
    tx: mpsc::Sender<TriggerRequest>,
}

impl TriggerHandle {
    /// Queues `req`, waiting for room if the queue is full.
    pub async fn signal(&self, req: TriggerRequest) -> Result<(), SignalError> {
        self.tx.send(req).await.map_err(|_| SignalError::Closed)
    }

    /// Queues `req` without waiting.
    pub fn try_signal(&self, req: TriggerRequest) -> Result<(), SignalError> {
        self.tx.try_send(req).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SignalError::Full,
            mpsc::error::TrySendError::Closed(_) => SignalError::Closed,
        })
    }

    /// Whether the control loop has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Creates a trigger queue holding at most `capacity` (min 1) pending requests.
pub(crate) fn channel(capacity: usize) -> (TriggerHandle, mpsc::Receiver<TriggerRequest>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (TriggerHandle { tx }, rx)
}
