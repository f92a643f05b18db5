use std::time::Duration;

use tokio::sync::mpsc;

use crate::classify::ErrorClass;
use crate::dispatch::RequestId;
use crate::store::RequestState;

/// Live progress notifications for a batch. Best-effort and unordered across requests.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    State {
        id: RequestId,
        state: RequestState,
    },
    Attempt {
        id: RequestId,
        index: u32,
    },
    Retrying {
        id: RequestId,
        index: u32,
        class: ErrorClass,
        delay: Duration,
    },
    /// Non-image text streamed by the provider.
    Text {
        id: RequestId,
        text: String,
    },
}

impl StatusEvent {
    pub fn id(&self) -> &RequestId {
        match self {
            Self::State { id, .. }
            | Self::Attempt { id, .. }
            | Self::Retrying { id, .. }
            | Self::Text { id, .. } => id,
        }
    }
}

/// Sending half of a batch's event channel. A detached sink drops everything.
#[derive(Debug, Clone, Default)]
pub struct StatusSink {
    tx: Option<mpsc::UnboundedSender<StatusEvent>>,
}

impl StatusSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn detached() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: StatusEvent) {
        if let Some(tx) = &self.tx {
            // Receiver gone means nobody is watching; progress is optional.
            let _ = tx.send(event);
        }
    }
}
