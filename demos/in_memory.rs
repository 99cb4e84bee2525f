use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use notify_dispatcher::{
    ChannelError, Channels, Dispatcher, DispatcherConfig, EmailChannel, EmailContact, EmailMessage,
    InMemoryOutbox, LocalLock, MerchantId, OutboxEvent, PushChannel, PushMessage, RecipientDirectory,
    SendReport, SmsChannel, SmsMessage,
};

/// Provider stand-in that only logs what it would send.
struct LogProvider;

#[async_trait]
impl PushChannel for LogProvider {
    async fn send_to_customers(
        &self,
        message: &PushMessage,
        customer_ids: &[String],
    ) -> Result<SendReport, ChannelError> {
        info!(title = %message.title, customers = customer_ids.len(), "push");
        let n = customer_ids.len() as u64;
        Ok(SendReport::new(n, n, 0))
    }

    async fn send_to_topic(&self, message: &PushMessage) -> Result<bool, ChannelError> {
        info!(merchant_id = %message.merchant_id, title = %message.title, "topic push");
        Ok(true)
    }
}

#[async_trait]
impl SmsChannel for LogProvider {
    async fn send_bulk(&self, message: &SmsMessage) -> Result<SendReport, ChannelError> {
        info!(recipients = message.recipients.len(), text = %message.text, "sms");
        let n = message.recipients.len() as u64;
        Ok(SendReport::new(n, n, 0))
    }
}

#[async_trait]
impl EmailChannel for LogProvider {
    async fn send(&self, message: &EmailMessage) -> Result<bool, ChannelError> {
        info!(to = %message.to, subject = %message.subject, "email");
        Ok(true)
    }
}

#[async_trait]
impl RecipientDirectory for LogProvider {
    async fn segment_customers(
        &self,
        _merchant_id: &MerchantId,
        _segment_id: &str,
    ) -> Result<Vec<String>, ChannelError> {
        Ok(vec!["cust_1".to_string(), "cust_2".to_string()])
    }

    async fn email_contacts(
        &self,
        _merchant_id: &MerchantId,
        customer_ids: &[String],
    ) -> Result<Vec<EmailContact>, ChannelError> {
        Ok(customer_ids
            .iter()
            .map(|id| EmailContact {
                customer_id: id.clone(),
                email: format!("{id}@example.com"),
                name: None,
            })
            .collect())
    }

    async fn merchant_name(&self, _merchant_id: &MerchantId) -> Result<Option<String>, ChannelError> {
        Ok(Some("Corner Bakery".to_string()))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let store = Arc::new(InMemoryOutbox::new());
    store
        .insert(OutboxEvent::new(
            "evt_1",
            "merchant_a",
            "notify.broadcast",
            json!({
                "channel": "ALL",
                "segmentId": "regulars",
                "template": { "subject": "Hi {{customerName}}", "text": "{{ pct }}% off today" },
                "variables": { "pct": 15 }
            }),
        ))
        .await;

    let provider = Arc::new(LogProvider);
    let channels = Channels {
        push: provider.clone(),
        sms: provider.clone(),
        email: provider.clone(),
        recipients: provider,
    };

    let config = DispatcherConfig {
        tick_interval: Duration::from_millis(200),
        ..Default::default()
    };
    let dispatcher = Arc::new(Dispatcher::new(config, store.clone(), Arc::new(LocalLock::new()), channels));

    let Some(handle) = dispatcher.spawn() else {
        return;
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    handle.shutdown().await;

    for row in store.snapshot().await {
        info!(event_id = %row.id, status = row.status.as_str(), retries = row.retries, "final state");
    }
}
