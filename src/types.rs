use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Event type for merchant broadcast campaigns.
pub const BROADCAST_EVENT: &str = "notify.broadcast";

/// Event type for single-recipient test sends.
pub const TEST_EVENT: &str = "notify.test";

/// Unique identifier for an outbox row.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of event IDs with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub String);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a merchant (tenant).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MerchantId(pub String);

impl fmt::Display for MerchantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of an outbox row.
///
/// Transitions only flow `Pending -> Sending -> {Sent, Dead, Pending}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboxStatus {
    Pending,
    Sending,
    Sent,
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Sending => "SENDING",
            OutboxStatus::Sent => "SENT",
            OutboxStatus::Dead => "DEAD",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Sent | OutboxStatus::Dead)
    }
}

impl FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "SENDING" => Ok(OutboxStatus::Sending),
            "SENT" => Ok(OutboxStatus::Sent),
            "DEAD" => Ok(OutboxStatus::Dead),
            other => Err(format!("unknown outbox status: {other}")),
        }
    }
}

/// One queued notification intent.
///
/// Rows are created `Pending` by producers. Only the dispatcher moves
/// `status`, `retries` and `next_retry_at` afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboxEvent {
    pub id: EventId,
    pub merchant_id: MerchantId,
    pub event_type: String,
    pub payload: Value,
    pub status: OutboxStatus,
    pub retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Create a new pending event enqueued now.
    pub fn new(
        id: impl Into<String>,
        merchant_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: EventId(id.into()),
            merchant_id: MerchantId(merchant_id.into()),
            event_type: event_type.into(),
            payload,
            status: OutboxStatus::Pending,
            retries: 0,
            next_retry_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Override the enqueue time.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }

    /// Override the retry count, e.g. for rows that already failed before.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Whether the row can be picked up by a tick at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.next_retry_at.map_or(true, |at| at <= now)
    }
}

/// Delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Channel {
    Email,
    Push,
    Sms,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "EMAIL",
            Channel::Push => "PUSH",
            Channel::Sms => "SMS",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EMAIL" => Ok(Channel::Email),
            "PUSH" => Ok(Channel::Push),
            "SMS" => Ok(Channel::Sms),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

impl TryFrom<String> for Channel {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Channel> for String {
    fn from(value: Channel) -> Self {
        value.as_str().to_string()
    }
}

/// Channel selector of a broadcast: one channel, or every channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChannelSelector {
    Only(Channel),
    #[default]
    All,
}

impl ChannelSelector {
    pub fn includes(&self, channel: Channel) -> bool {
        match self {
            ChannelSelector::Only(selected) => *selected == channel,
            ChannelSelector::All => true,
        }
    }
}

impl TryFrom<String> for ChannelSelector {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.trim().eq_ignore_ascii_case("ALL") {
            return Ok(ChannelSelector::All);
        }
        value.parse().map(ChannelSelector::Only)
    }
}

impl From<ChannelSelector> for String {
    fn from(value: ChannelSelector) -> Self {
        match value {
            ChannelSelector::Only(channel) => channel.into(),
            ChannelSelector::All => "ALL".to_string(),
        }
    }
}

/// Message template; fields may carry `{{ var }}` placeholders.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
}

/// Payload of a `notify.broadcast` event.
///
/// Producers write `null` for every optional field they were not given, so
/// `null`, a missing key and (for ids) a blank string all read as absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastPayload {
    #[serde(default, deserialize_with = "null_as_default")]
    pub channel: ChannelSelector,
    #[serde(default, deserialize_with = "blank_merchant_id")]
    pub merchant_id: Option<MerchantId>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub segment_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub template: Template,
    #[serde(default, deserialize_with = "null_as_default")]
    pub variables: Map<String, Value>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub dry_run: bool,
}

/// Payload of a `notify.test` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestPayload {
    pub channel: Channel,
    #[serde(default, deserialize_with = "blank_merchant_id")]
    pub merchant_id: Option<MerchantId>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub to: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub template: Template,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn blank_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty()))
}

fn blank_merchant_id<'de, D>(deserializer: D) -> Result<Option<MerchantId>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(blank_as_none(deserializer)?.map(MerchantId))
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(truthy(&Value::deserialize(deserializer)?))
}

/// Reads the usual spellings of an on/off flag. Anything unrecognized is off.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "y" | "on"
        ),
        _ => false,
    }
}

/// A claimed event's payload, decoded once according to its `event_type`.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Broadcast(BroadcastPayload),
    Test(TestPayload),
    /// Any other type inside the notification namespace. The payload is
    /// never inspected.
    Unknown,
}

impl Notification {
    pub fn decode(event_type: &str, payload: &Value) -> Result<Self, serde_json::Error> {
        match event_type {
            BROADCAST_EVENT => Ok(Notification::Broadcast(BroadcastPayload::deserialize(payload)?)),
            TEST_EVENT => Ok(Notification::Test(TestPayload::deserialize(payload)?)),
            _ => Ok(Notification::Unknown),
        }
    }

    /// Label used for the `type` dimension of processing metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Broadcast(_) => "broadcast",
            Notification::Test(_) => "test",
            Notification::Unknown => "unknown",
        }
    }
}

/// Label for an event type that failed to decode.
pub(crate) fn kind_of(event_type: &str) -> &'static str {
    match event_type {
        BROADCAST_EVENT => "broadcast",
        TEST_EVENT => "test",
        _ => "unknown",
    }
}
