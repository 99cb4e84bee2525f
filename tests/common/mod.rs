#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use notify_dispatcher::{
    ChannelError, Channels, Dispatcher, DispatcherConfig, EmailChannel, EmailContact, EmailMessage,
    InMemoryOutbox, LocalLock, MerchantId, OutboxEvent, OutboxStatus, OutboxStore, PushChannel,
    PushMessage, RecipientDirectory, SendReport, SmsChannel, SmsMessage, TickOutcome, TickReport,
};

/// Fake collaborators that record every call and can be told to fail.
#[derive(Default)]
pub struct Recorder {
    pub pushes: Mutex<Vec<(PushMessage, Vec<String>)>>,
    pub topic_pushes: Mutex<Vec<PushMessage>>,
    pub sms: Mutex<Vec<SmsMessage>>,
    pub emails: Mutex<Vec<EmailMessage>>,
    pub push_error: Mutex<Option<String>>,
    pub sms_error: Mutex<Option<String>>,
    pub email_error: Mutex<Option<String>>,
    pub segments: Mutex<HashMap<String, Vec<String>>>,
    pub contacts: Mutex<Vec<EmailContact>>,
    pub merchant_names: Mutex<HashMap<String, String>>,
    pub push_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl Recorder {
    pub fn fail_push(&self, message: &str) {
        *self.push_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_email(&self, message: &str) {
        *self.email_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn add_segment(&self, segment_id: &str, customers: &[&str]) {
        self.segments.lock().unwrap().insert(
            segment_id.to_string(),
            customers.iter().map(|c| c.to_string()).collect(),
        );
    }

    pub fn add_contact(&self, customer_id: &str, email: &str, name: Option<&str>) {
        self.contacts.lock().unwrap().push(EmailContact {
            customer_id: customer_id.to_string(),
            email: email.to_string(),
            name: name.map(str::to_string),
        });
    }

    /// Make push calls wait for a permit on the returned gate.
    pub fn hold_push(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.push_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    async fn pass_push_gate(&self) {
        let gate = self.push_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.unwrap();
        }
    }

    /// Total number of provider calls of any kind.
    pub fn calls(&self) -> usize {
        self.pushes.lock().unwrap().len()
            + self.topic_pushes.lock().unwrap().len()
            + self.sms.lock().unwrap().len()
            + self.emails.lock().unwrap().len()
    }

    fn check(slot: &Mutex<Option<String>>) -> Result<(), ChannelError> {
        match slot.lock().unwrap().as_ref() {
            Some(message) => Err(ChannelError::new(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PushChannel for Recorder {
    async fn send_to_customers(
        &self,
        message: &PushMessage,
        customer_ids: &[String],
    ) -> Result<SendReport, ChannelError> {
        self.pass_push_gate().await;
        Self::check(&self.push_error)?;
        self.pushes
            .lock()
            .unwrap()
            .push((message.clone(), customer_ids.to_vec()));
        let n = customer_ids.len() as u64;
        Ok(SendReport::new(n, n, 0))
    }

    async fn send_to_topic(&self, message: &PushMessage) -> Result<bool, ChannelError> {
        self.pass_push_gate().await;
        Self::check(&self.push_error)?;
        self.topic_pushes.lock().unwrap().push(message.clone());
        Ok(true)
    }
}

#[async_trait]
impl SmsChannel for Recorder {
    async fn send_bulk(&self, message: &SmsMessage) -> Result<SendReport, ChannelError> {
        Self::check(&self.sms_error)?;
        self.sms.lock().unwrap().push(message.clone());
        let n = message.recipients.len() as u64;
        Ok(SendReport::new(n, n, 0))
    }
}

#[async_trait]
impl EmailChannel for Recorder {
    async fn send(&self, message: &EmailMessage) -> Result<bool, ChannelError> {
        Self::check(&self.email_error)?;
        self.emails.lock().unwrap().push(message.clone());
        Ok(true)
    }
}

#[async_trait]
impl RecipientDirectory for Recorder {
    async fn segment_customers(
        &self,
        _merchant_id: &MerchantId,
        segment_id: &str,
    ) -> Result<Vec<String>, ChannelError> {
        Ok(self
            .segments
            .lock()
            .unwrap()
            .get(segment_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn email_contacts(
        &self,
        _merchant_id: &MerchantId,
        customer_ids: &[String],
    ) -> Result<Vec<EmailContact>, ChannelError> {
        Ok(self
            .contacts
            .lock()
            .unwrap()
            .iter()
            .filter(|c| customer_ids.contains(&c.customer_id))
            .cloned()
            .collect())
    }

    async fn merchant_name(&self, merchant_id: &MerchantId) -> Result<Option<String>, ChannelError> {
        Ok(self.merchant_names.lock().unwrap().get(&merchant_id.0).cloned())
    }
}

pub struct Harness {
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<InMemoryOutbox>,
    pub lock: Arc<LocalLock>,
    pub recorder: Arc<Recorder>,
}

impl Harness {
    pub fn new(config: DispatcherConfig) -> Self {
        let store = Arc::new(InMemoryOutbox::new());
        let lock = Arc::new(LocalLock::new());
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::new(config, store.clone(), lock.clone(), channels(&recorder));
        Self {
            dispatcher: Arc::new(dispatcher),
            store,
            lock,
            recorder,
        }
    }

    pub async fn insert(&self, event: OutboxEvent) {
        self.store.insert(event).await;
    }

    pub async fn row(&self, id: &str) -> OutboxEvent {
        self.store
            .get(&notify_dispatcher::EventId(id.to_string()))
            .await
            .expect("row exists")
    }

    /// Poll until the row reaches `status`.
    pub async fn wait_for(&self, id: &str, status: OutboxStatus) {
        for _ in 0..400 {
            if self.row(id).await.status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{id} never reached {status:?}");
    }

    /// Run one tick and expect it to complete.
    pub async fn tick(&self) -> TickReport {
        match self.dispatcher.tick().await.expect("tick succeeds") {
            TickOutcome::Completed(report) => report,
            TickOutcome::Skipped(reason) => panic!("tick skipped: {reason:?}"),
        }
    }
}

pub fn channels(recorder: &Arc<Recorder>) -> Channels {
    Channels {
        push: recorder.clone(),
        sms: recorder.clone(),
        email: recorder.clone(),
        recipients: recorder.clone(),
    }
}

/// Enabled, production-mode config with defaults suitable for tests.
pub fn config() -> DispatcherConfig {
    DispatcherConfig {
        enabled: true,
        tick_interval: Duration::from_millis(10),
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

pub fn broadcast(id: &str, merchant: &str, payload: Value) -> OutboxEvent {
    OutboxEvent::new(id, merchant, "notify.broadcast", payload)
}

pub fn topic_push(id: &str, merchant: &str) -> OutboxEvent {
    broadcast(
        id,
        merchant,
        json!({ "channel": "PUSH", "template": { "subject": id, "text": "hello" } }),
    )
}

pub fn test_send(id: &str, merchant: &str, channel: &str, to: &str) -> OutboxEvent {
    OutboxEvent::new(
        id,
        merchant,
        "notify.test",
        json!({ "channel": channel, "to": to, "template": { "subject": "Hi", "text": "Test body" } }),
    )
}

pub fn ago(seconds: i64) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::seconds(seconds)
}

/// Store whose every query fails.
pub struct BrokenStore;

#[async_trait]
impl OutboxStore for BrokenStore {
    async fn fetch_due(
        &self,
        _namespace: &str,
        _now: DateTime<Utc>,
        _limit: usize,
    ) -> Result<Vec<OutboxEvent>, notify_dispatcher::StoreError> {
        Err(notify_dispatcher::StoreError::Backend("connection refused".into()))
    }

    async fn claim(
        &self,
        _id: &notify_dispatcher::EventId,
        _now: DateTime<Utc>,
    ) -> Result<bool, notify_dispatcher::StoreError> {
        Err(notify_dispatcher::StoreError::Backend("connection refused".into()))
    }

    async fn resolve(
        &self,
        _id: &notify_dispatcher::EventId,
        _transition: &notify_dispatcher::Transition,
        _now: DateTime<Utc>,
    ) -> Result<bool, notify_dispatcher::StoreError> {
        Err(notify_dispatcher::StoreError::Backend("connection refused".into()))
    }

    async fn recover_stale(
        &self,
        _namespace: &str,
        _stale_before: DateTime<Utc>,
        _now: DateTime<Utc>,
    ) -> Result<u64, notify_dispatcher::StoreError> {
        Err(notify_dispatcher::StoreError::Backend("connection refused".into()))
    }
}
