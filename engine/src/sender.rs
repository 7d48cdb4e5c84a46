use thiserror::Error;

#[derive(Debug, Error)]
#[error("message delivery failed: {0}")]
pub struct SenderError(pub String);

/// Outbound message delivery. Fire-and-forget from the engine's point
/// of view: a send failure is logged by the caller and never rolls back
/// state that was already committed.
#[allow(async_fn_in_trait)]
pub trait MessageSender: Send + Sync {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), SenderError>;
}

/// Logs outbound messages instead of delivering them. The real
/// transport lives outside the engine; this keeps local runs honest.
#[derive(Debug, Default, Clone)]
pub struct TracingSender;

impl MessageSender for TracingSender {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), SenderError> {
        tracing::info!(recipient, text, "outbound message");
        Ok(())
    }
}

/// Captures every send for assertions; optionally fails to exercise the
/// degraded path.
#[derive(Debug, Default)]
pub struct RecordingSender {
    sent: std::sync::Mutex<Vec<(String, String)>>,
    fail: std::sync::atomic::AtomicBool,
}

impl RecordingSender {
    pub fn new() -> RecordingSender {
        RecordingSender::default()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

impl MessageSender for RecordingSender {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), SenderError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(SenderError("injected failure".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), text.to_string()));
        Ok(())
    }
}
