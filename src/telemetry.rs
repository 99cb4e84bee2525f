//! Counters emitted through the `metrics` facade.
//!
//! With the `metrics` feature off every helper compiles to nothing.

use crate::channels::SendReport;
use crate::types::{Channel, MerchantId};

#[cfg(feature = "metrics")]
pub(crate) fn processed(kind: &'static str, result: &'static str) {
    metrics::increment_counter!("notifications_processed_total", "type" => kind, "result" => result);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn processed(_kind: &'static str, _result: &'static str) {}

#[cfg(feature = "metrics")]
pub(crate) fn channel_report(channel: Channel, merchant_id: &MerchantId, report: &SendReport) {
    let merchant = merchant_id.0.clone();
    if report.attempted > 0 {
        metrics::counter!(
            "notifications_channel_attempts_total",
            report.attempted,
            "channel" => channel.as_str(),
            "merchantId" => merchant.clone()
        );
    }
    if report.sent > 0 {
        metrics::counter!(
            "notifications_channel_sent_total",
            report.sent,
            "channel" => channel.as_str(),
            "merchantId" => merchant.clone()
        );
    }
    if report.failed > 0 {
        metrics::counter!(
            "notifications_channel_failed_total",
            report.failed,
            "channel" => channel.as_str(),
            "merchantId" => merchant
        );
    }
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn channel_report(_channel: Channel, _merchant_id: &MerchantId, _report: &SendReport) {}

#[cfg(feature = "metrics")]
pub(crate) fn throttled(merchant_id: &MerchantId) {
    metrics::increment_counter!("notifications_throttled_total", "merchantId" => merchant_id.0.clone());
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn throttled(_merchant_id: &MerchantId) {}

#[cfg(feature = "metrics")]
pub(crate) fn claim_lost() {
    metrics::increment_counter!("notifications_claim_conflicts_total");
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn claim_lost() {}

#[cfg(feature = "metrics")]
pub(crate) fn last_tick(worker: &str, epoch_seconds: i64) {
    metrics::gauge!("notify_worker_last_tick_seconds", epoch_seconds as f64, "worker" => worker.to_string());
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn last_tick(_worker: &str, _epoch_seconds: i64) {}
