//! Metrics definitions for the indexer.
//!
//! This module defines all metrics used throughout the indexer.
//! Metrics are collected using the `metrics` crate and can be exported
//! to Prometheus via `metrics-exporter-prometheus`.

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use std::time::Instant;

use crate::queue::QueueStat;

/// Initialize all metric descriptions.
/// Call this once at startup before any metrics are recorded.
pub fn init_metrics() {
    describe_counter!(
        "blocks_processed_total",
        "Total number of block processing attempts, by phase and outcome"
    );
    describe_counter!(
        "block_retries_total",
        "Total number of blocks scheduled for retry after a failed attempt"
    );
    describe_histogram!(
        "block_processing_duration_seconds",
        "Time taken to process a block in seconds"
    );
    describe_counter!(
        "messages_published_total",
        "Total number of messages published to the broker, by topic"
    );
    describe_counter!(
        "messages_delivered_total",
        "Total number of records delivered to client connections, by topic"
    );
    describe_counter!(
        "broker_decode_errors_total",
        "Total number of broker payloads dropped because they could not be decoded"
    );
    describe_counter!(
        "client_send_failures_total",
        "Total number of failed writes to client connections"
    );
    describe_gauge!(
        "active_topic_consumers",
        "Number of topic consumers currently subscribed to the broker"
    );
    describe_gauge!(
        "queue_blocks",
        "Blocks tracked by the block queue, by lifecycle state"
    );
}

/// Record the outcome of a block processing attempt.
///
/// # Arguments
/// * `phase` - "unconfirmed" or "confirmed"
/// * `outcome` - "done" or "failed"
pub fn record_block_processed(phase: &'static str, outcome: &'static str) {
    counter!("blocks_processed_total", "phase" => phase, "outcome" => outcome).increment(1);
}

/// Record a block scheduled for retry.
pub fn record_block_retry(phase: &'static str) {
    counter!("block_retries_total", "phase" => phase).increment(1);
}

/// Record block processing duration.
pub fn record_block_processing_duration(duration_secs: f64) {
    histogram!("block_processing_duration_seconds").record(duration_secs);
}

/// Record messages published to a broker topic.
pub fn record_published(topic: &'static str, count: u64) {
    counter!("messages_published_total", "topic" => topic).increment(count);
}

/// Record a record delivered to a client connection.
pub fn record_delivered(topic: &'static str) {
    counter!("messages_delivered_total", "topic" => topic).increment(1);
}

/// Record a broker payload that failed to decode.
pub fn record_decode_error(topic: &'static str) {
    counter!("broker_decode_errors_total", "topic" => topic).increment(1);
}

/// Record a failed write to a client connection.
pub fn record_send_failure() {
    counter!("client_send_failures_total").increment(1);
}

/// Track the number of live topic consumers.
pub fn record_consumer_started() {
    gauge!("active_topic_consumers").increment(1.0);
}

/// Track the number of live topic consumers.
pub fn record_consumer_stopped() {
    gauge!("active_topic_consumers").decrement(1.0);
}

/// Export a queue snapshot as gauges.
pub fn record_queue_stat(stat: &QueueStat) {
    gauge!("queue_blocks", "state" => "unconfirmed_progress")
        .set(stat.unconfirmed_progress as f64);
    gauge!("queue_blocks", "state" => "unconfirmed_waiting").set(stat.unconfirmed_waiting as f64);
    gauge!("queue_blocks", "state" => "confirmed_progress").set(stat.confirmed_progress as f64);
    gauge!("queue_blocks", "state" => "confirmed_waiting").set(stat.confirmed_waiting as f64);
    gauge!("queue_blocks", "state" => "total").set(stat.total as f64);
}

/// A timer that automatically records duration when dropped.
pub struct ProcessingTimer {
    start: Instant,
}

impl ProcessingTimer {
    /// Start a new processing timer.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for ProcessingTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessingTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_block_processing_duration(duration);
    }
}
