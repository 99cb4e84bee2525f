use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::channels::{render, stringify, Channels, EmailMessage, PushMessage, SendReport, SmsMessage};
use crate::config::RuntimeMode;
use crate::error::{ChannelError, HandleError};
use crate::rate_limit::RateLimiter;
use crate::telemetry;
use crate::types::{
    truthy, BroadcastPayload, Channel, MerchantId, Notification, OutboxEvent, TestPayload, BROADCAST_EVENT,
    TEST_EVENT,
};

/// `last_error` of a throttled event.
pub const THROTTLED_MARKER: &str = "throttled";
/// `last_error` of a broadcast acknowledged because of its `dryRun` flag.
pub const DRY_RUN_MARKER: &str = "dry-run";
/// `last_error` of an event short-circuited outside production.
pub const TEST_ENV_MARKER: &str = "test-env";
/// `last_error` of an acknowledged event with an unrecognized type.
pub const UNKNOWN_TYPE_MARKER: &str = "unknown notify type";
/// `last_error` of a push test send, which is acknowledged without delivery.
pub const PUSH_TEST_SKIPPED_MARKER: &str = "push test skipped";

const DEFAULT_TITLE: &str = "New message";
const DEFAULT_BODY: &str = "You have a new message";
const DEFAULT_TEST_SUBJECT: &str = "Test";
const DEFAULT_TEST_TEXT: &str = "Test message";
const DEFAULT_CUSTOMER_NAME: &str = "Customer";
const DEFAULT_MERCHANT_NAME: &str = "Merchant";
const EMAIL_TEMPLATE: &str = "campaign";

/// Outcome of a handling attempt that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// Acknowledge as `SENT`; `result` is the metrics label (`sent` or `dry`).
    Sent {
        marker: Option<&'static str>,
        result: &'static str,
    },
    /// Over the merchant's budget; defer without counting a failure.
    Throttled,
}

impl Resolution {
    fn sent() -> Self {
        Resolution::Sent {
            marker: None,
            result: "sent",
        }
    }

    fn dry(marker: &'static str) -> Self {
        Resolution::Sent {
            marker: Some(marker),
            result: "dry",
        }
    }
}

/// Recipients of a broadcast.
enum Audience {
    /// Explicit customers resolved from a segment. May be empty.
    Segment(Vec<String>),
    /// Every subscriber of the merchant's topic.
    Topic,
}

/// Routes a decoded notification to the delivery channels.
pub(crate) struct NotificationHandler {
    channels: Channels,
    limiter: Arc<dyn RateLimiter>,
    runtime: RuntimeMode,
}

impl NotificationHandler {
    pub(crate) fn new(channels: Channels, limiter: Arc<dyn RateLimiter>, runtime: RuntimeMode) -> Self {
        Self {
            channels,
            limiter,
            runtime,
        }
    }

    pub(crate) fn set_rate_limiter(&mut self, limiter: Arc<dyn RateLimiter>) {
        self.limiter = limiter;
    }

    /// Decode `event` and deliver it.
    pub(crate) async fn handle(&self, event: &OutboxEvent) -> Result<Resolution, HandleError> {
        if let Some(resolution) = self.short_circuit(event) {
            return Ok(resolution);
        }

        match Notification::decode(&event.event_type, &event.payload)? {
            Notification::Broadcast(payload) => self.handle_broadcast(event, &payload).await,
            Notification::Test(payload) => self.handle_test(event, &payload).await,
            Notification::Unknown => {
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Acknowledging notification with unknown type"
                );
                Ok(Resolution::Sent {
                    marker: Some(UNKNOWN_TYPE_MARKER),
                    result: "sent",
                })
            }
        }
    }

    /// Acknowledgements that depend only on the runtime and the `dryRun`
    /// flag. They are decided before the rest of the payload is validated.
    fn short_circuit(&self, event: &OutboxEvent) -> Option<Resolution> {
        match event.event_type.as_str() {
            BROADCAST_EVENT if event.payload.get("dryRun").is_some_and(truthy) => {
                Some(Resolution::dry(DRY_RUN_MARKER))
            }
            BROADCAST_EVENT | TEST_EVENT if !self.runtime.is_production() => {
                Some(Resolution::dry(TEST_ENV_MARKER))
            }
            _ => None,
        }
    }

    async fn handle_test(&self, event: &OutboxEvent, payload: &TestPayload) -> Result<Resolution, HandleError> {
        let merchant_id = payload.merchant_id.clone().unwrap_or_else(|| event.merchant_id.clone());
        let to = payload.to.trim();
        if to.is_empty() && payload.channel != Channel::Push {
            return Err(HandleError::InvalidPayload("test send requires a recipient address".into()));
        }
        let subject = non_empty(&payload.template.subject).unwrap_or(DEFAULT_TEST_SUBJECT);
        let text = non_empty(&payload.template.text).unwrap_or(DEFAULT_TEST_TEXT);

        match payload.channel {
            Channel::Email => {
                let content = non_empty(&payload.template.html).unwrap_or(text);
                let message = EmailMessage {
                    merchant_id: merchant_id.clone(),
                    to: to.to_string(),
                    subject: subject.to_string(),
                    template: EMAIL_TEMPLATE.to_string(),
                    customer_name: String::new(),
                    merchant_name: String::new(),
                    content: content.to_string(),
                };
                let ok = self.channels.email.send(&message).await?;
                if !ok {
                    warn!(event_id = %event.id, merchant_id = %merchant_id, "Email provider refused test message");
                }
                telemetry::channel_report(Channel::Email, &merchant_id, &SendReport::single(ok));
            }
            Channel::Sms => {
                let message = SmsMessage {
                    merchant_id: merchant_id.clone(),
                    recipients: vec![to.to_string()],
                    text: text.to_string(),
                };
                let report = self.channels.sms.send_bulk(&message).await?;
                telemetry::channel_report(Channel::Sms, &merchant_id, &report);
            }
            Channel::Push => {
                return Ok(Resolution::Sent {
                    marker: Some(PUSH_TEST_SKIPPED_MARKER),
                    result: "sent",
                });
            }
        }

        Ok(Resolution::sent())
    }

    async fn handle_broadcast(
        &self,
        event: &OutboxEvent,
        payload: &BroadcastPayload,
    ) -> Result<Resolution, HandleError> {
        let merchant_id = payload.merchant_id.clone().unwrap_or_else(|| event.merchant_id.clone());
        if !self.limiter.try_admit(&merchant_id).await? {
            return Ok(Resolution::Throttled);
        }

        let audience = match payload.segment_id.as_deref() {
            Some(segment_id) => Audience::Segment(
                self.channels
                    .recipients
                    .segment_customers(&merchant_id, segment_id)
                    .await?,
            ),
            None => Audience::Topic,
        };

        let mut errors = Vec::new();
        let mut reports = Vec::new();
        let channels = [Channel::Push, Channel::Sms, Channel::Email];
        for channel in channels.into_iter().filter(|c| payload.channel.includes(*c)) {
            let outcome = match channel {
                Channel::Push => self.broadcast_push(&merchant_id, payload, &audience).await,
                Channel::Sms => self.broadcast_sms(&merchant_id, payload, &audience).await,
                Channel::Email => self.broadcast_email(&merchant_id, payload, &audience).await,
            };
            match outcome {
                Ok(report) => {
                    telemetry::channel_report(channel, &merchant_id, &report);
                    reports.push((channel, report));
                }
                Err(err) => {
                    warn!(
                        event_id = %event.id,
                        merchant_id = %merchant_id,
                        channel = %channel,
                        error = %err,
                        "Broadcast channel failed"
                    );
                    errors.push(format!("{}: {}", channel.as_str().to_ascii_lowercase(), err));
                }
            }
        }

        if !errors.is_empty() {
            return Err(HandleError::Channels(errors.join("; ")));
        }

        let summary: Vec<String> = reports
            .iter()
            .map(|(channel, r)| format!("{channel}={}/{}/{}", r.attempted, r.sent, r.failed))
            .collect();
        info!(
            event_id = %event.id,
            merchant_id = %merchant_id,
            channel = %String::from(payload.channel),
            segment_id = payload.segment_id.as_deref().unwrap_or(""),
            channels = %summary.join(","),
            "broadcast.sent"
        );

        Ok(Resolution::sent())
    }

    async fn broadcast_push(
        &self,
        merchant_id: &MerchantId,
        payload: &BroadcastPayload,
        audience: &Audience,
    ) -> Result<SendReport, ChannelError> {
        let vars = &payload.variables;
        let message = PushMessage {
            merchant_id: merchant_id.clone(),
            title: render_or(&payload.template.subject, vars, DEFAULT_TITLE),
            body: render_or(&payload.template.text, vars, DEFAULT_BODY),
            data: string_map(vars),
        };

        match audience {
            Audience::Segment(customers) if customers.is_empty() => Ok(SendReport::default()),
            Audience::Segment(customers) => self.channels.push.send_to_customers(&message, customers).await,
            Audience::Topic => {
                let ok = self.channels.push.send_to_topic(&message).await?;
                Ok(SendReport::single(ok))
            }
        }
    }

    async fn broadcast_sms(
        &self,
        merchant_id: &MerchantId,
        payload: &BroadcastPayload,
        audience: &Audience,
    ) -> Result<SendReport, ChannelError> {
        let Audience::Segment(customers) = audience else {
            debug!(merchant_id = %merchant_id, "SMS has no topic delivery, skipping");
            return Ok(SendReport::default());
        };
        if customers.is_empty() {
            return Ok(SendReport::default());
        }

        let message = SmsMessage {
            merchant_id: merchant_id.clone(),
            recipients: customers.clone(),
            text: render_or(&payload.template.text, &payload.variables, DEFAULT_BODY),
        };
        self.channels.sms.send_bulk(&message).await
    }

    async fn broadcast_email(
        &self,
        merchant_id: &MerchantId,
        payload: &BroadcastPayload,
        audience: &Audience,
    ) -> Result<SendReport, ChannelError> {
        let Audience::Segment(customers) = audience else {
            debug!(merchant_id = %merchant_id, "Email has no topic delivery, skipping");
            return Ok(SendReport::default());
        };
        if customers.is_empty() {
            return Ok(SendReport::default());
        }

        let recipients = &self.channels.recipients;
        let contacts = recipients.email_contacts(merchant_id, customers).await?;
        if contacts.is_empty() {
            return Ok(SendReport::default());
        }
        let merchant_name = recipients
            .merchant_name(merchant_id)
            .await?
            .unwrap_or_else(|| DEFAULT_MERCHANT_NAME.to_string());

        let body_template = non_empty(&payload.template.html)
            .or_else(|| non_empty(&payload.template.text))
            .unwrap_or("");

        let mut report = SendReport::default();
        for contact in contacts {
            let customer_name = contact
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CUSTOMER_NAME.to_string());
            let mut ctx = payload.variables.clone();
            ctx.insert("customerName".into(), Value::String(customer_name.clone()));
            ctx.insert("merchantName".into(), Value::String(merchant_name.clone()));

            let message = EmailMessage {
                merchant_id: merchant_id.clone(),
                to: contact.email,
                subject: render_or(&payload.template.subject, &ctx, DEFAULT_TITLE),
                template: EMAIL_TEMPLATE.to_string(),
                customer_name,
                merchant_name: merchant_name.clone(),
                content: render(body_template, &ctx),
            };
            let ok = self.channels.email.send(&message).await?;
            report.absorb(SendReport::single(ok));
        }
        Ok(report)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}

fn render_or(template: &Option<String>, vars: &Map<String, Value>, fallback: &str) -> String {
    let rendered = non_empty(template).map(|t| render(t, vars)).unwrap_or_default();
    if rendered.trim().is_empty() {
        fallback.to_string()
    } else {
        rendered
    }
}

fn string_map(vars: &Map<String, Value>) -> BTreeMap<String, String> {
    vars.iter().map(|(k, v)| (k.clone(), stringify(v))).collect()
}
