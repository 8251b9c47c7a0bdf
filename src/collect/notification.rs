use super::{forward, message, Batch, CollectContext, CollectError};

/// Sends every record as its own message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotificationStrategy;

impl NotificationStrategy {
    pub fn name(&self) -> &str {
        "notification"
    }

    pub async fn deliver(
        &self,
        batch: &Batch<'_>,
        ctx: &CollectContext<'_>,
    ) -> Result<bool, CollectError> {
        let messages = batch
            .records
            .iter()
            .map(|record| message::encode(self.name(), batch, std::slice::from_ref(record)))
            .collect::<Result<Vec<_>, _>>()?;

        forward(messages, ctx).await
    }
}
