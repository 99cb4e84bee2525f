//! Contracts of the delivery collaborators.
//!
//! The dispatcher never talks to a provider directly. Push gateways, SMS
//! gateways, the email renderer and the customer directory are supplied by the
//! host application through these traits.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::ChannelError;
use crate::types::MerchantId;

/// Counts reported by a provider for one fan-out call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    pub attempted: u64,
    pub sent: u64,
    pub failed: u64,
}

impl SendReport {
    pub fn new(attempted: u64, sent: u64, failed: u64) -> Self {
        Self {
            attempted,
            sent,
            failed,
        }
    }

    /// Report for a single message that either went out or not.
    pub fn single(ok: bool) -> Self {
        Self::new(1, ok as u64, (!ok) as u64)
    }

    pub fn absorb(&mut self, other: SendReport) {
        self.attempted += other.attempted;
        self.sent += other.sent;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub merchant_id: MerchantId,
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsMessage {
    pub merchant_id: MerchantId,
    /// Customer ids for campaigns, or a raw phone number for test sends.
    pub recipients: Vec<String>,
    pub text: String,
}

/// One rendered campaign email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub merchant_id: MerchantId,
    pub to: String,
    pub subject: String,
    pub template: String,
    pub customer_name: String,
    pub merchant_name: String,
    pub content: String,
}

/// Customer reachable by email, as returned by the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailContact {
    pub customer_id: String,
    pub email: String,
    pub name: Option<String>,
}

#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Push to explicit customers of a merchant.
    async fn send_to_customers(
        &self,
        message: &PushMessage,
        customer_ids: &[String],
    ) -> Result<SendReport, ChannelError>;

    /// Push to every subscriber of the merchant's topic.
    async fn send_to_topic(&self, message: &PushMessage) -> Result<bool, ChannelError>;
}

#[async_trait]
pub trait SmsChannel: Send + Sync {
    async fn send_bulk(&self, message: &SmsMessage) -> Result<SendReport, ChannelError>;
}

#[async_trait]
pub trait EmailChannel: Send + Sync {
    /// Send one message. `Ok(false)` means the provider refused it.
    async fn send(&self, message: &EmailMessage) -> Result<bool, ChannelError>;
}

#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    /// Customer ids in a merchant's segment.
    async fn segment_customers(
        &self,
        merchant_id: &MerchantId,
        segment_id: &str,
    ) -> Result<Vec<String>, ChannelError>;

    /// Customers among `customer_ids` that have an email address and have
    /// not withdrawn email consent.
    async fn email_contacts(
        &self,
        merchant_id: &MerchantId,
        customer_ids: &[String],
    ) -> Result<Vec<EmailContact>, ChannelError>;

    async fn merchant_name(&self, merchant_id: &MerchantId) -> Result<Option<String>, ChannelError>;
}

/// The set of collaborators a dispatcher fans out to.
#[derive(Clone)]
pub struct Channels {
    pub push: Arc<dyn PushChannel>,
    pub sms: Arc<dyn SmsChannel>,
    pub email: Arc<dyn EmailChannel>,
    pub recipients: Arc<dyn RecipientDirectory>,
}

fn placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*([a-zA-Z0-9_.]+)\s*\}\}").expect("valid placeholder pattern"))
}

/// Substitute `{{ a.b }}` placeholders with values looked up in `vars`.
///
/// Missing paths render as an empty string; non-string values render as JSON.
pub fn render(template: &str, vars: &Map<String, Value>) -> String {
    if template.is_empty() {
        return String::new();
    }
    placeholder()
        .replace_all(template, |caps: &regex::Captures<'_>| lookup(vars, &caps[1]))
        .into_owned()
}

fn lookup(vars: &Map<String, Value>, path: &str) -> String {
    let mut parts = path.split('.');
    let Some(first) = parts.next() else {
        return String::new();
    };
    let mut current = match vars.get(first) {
        Some(v) => v,
        None => return String::new(),
    };
    for key in parts {
        match current.get(key) {
            Some(v) => current = v,
            None => return String::new(),
        }
    }
    stringify(current)
}

pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn substitutes_nested_paths() {
        let v = vars(json!({ "name": "Ann", "offer": { "pct": 15 } }));
        assert_eq!(render("Hi {{name}}, take {{ offer.pct }}%!", &v), "Hi Ann, take 15%!");
    }

    #[test]
    fn missing_paths_render_empty() {
        let v = vars(json!({ "offer": "flat" }));
        assert_eq!(render("[{{ missing }}][{{ offer.pct }}]", &v), "[][]");
    }

    #[test]
    fn text_without_placeholders_is_untouched() {
        assert_eq!(render("plain {text}", &Map::new()), "plain {text}");
        assert_eq!(render("", &Map::new()), "");
    }

    #[test]
    fn single_reports_count_one_attempt() {
        let mut total = SendReport::default();
        total.absorb(SendReport::single(true));
        total.absorb(SendReport::single(false));
        assert_eq!(total, SendReport::new(2, 1, 1));
    }
}
