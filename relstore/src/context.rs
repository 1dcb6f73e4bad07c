use tokio_util::sync::CancellationToken;
use tracing::Span;
use uuid::Uuid;

/// Per-save ambient state: an id for log correlation, the span every
/// event of the save is recorded under, and a cancellation signal.
#[derive(Debug, Clone)]
pub struct SaveContext {
    id: Uuid,
    span: Span,
    cancel: CancellationToken,
}

impl SaveContext {
    pub fn new() -> Self {
        Self::with_cancellation(CancellationToken::new())
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        let id = Uuid::now_v7();
        let span = tracing::info_span!("save_changes", save_id = %id);
        Self { id, span, cancel }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

impl Default for SaveContext {
    fn default() -> Self {
        Self::new()
    }
}
