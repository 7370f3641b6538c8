//! Kafka record headers carried alongside the JSON envelope.

use courier_core::Envelope;
use rdkafka::message::{Header, Headers, OwnedHeaders};

/// Outbox message id.
pub const MESSAGE_ID: &str = "message-id";
/// Correlation id consumers de-duplicate on.
pub const CORRELATION_ID: &str = "correlation-id";
/// Routing key (also the record key).
pub const ROUTING_KEY: &str = "routing-key";
/// 1-based delivery attempt, incremented on requeue.
pub const DELIVERY_COUNT: &str = "delivery-count";
/// Why a record was dead-lettered.
pub const DEAD_LETTER_REASON: &str = "dead-letter-reason";
/// Exchange a dead-lettered record was originally published to.
pub const ORIGINAL_EXCHANGE: &str = "original-exchange";

/// Headers for a record carrying `envelope`.
#[must_use]
pub fn envelope_headers(envelope: &Envelope, routing_key: &str, delivery_count: u32) -> OwnedHeaders {
    let message_id = envelope.message_id.to_string();
    let correlation_id = envelope.correlation_id.to_string();
    let delivery_count = delivery_count.to_string();

    OwnedHeaders::new()
        .insert(Header {
            key: MESSAGE_ID,
            value: Some(message_id.as_str()),
        })
        .insert(Header {
            key: CORRELATION_ID,
            value: Some(correlation_id.as_str()),
        })
        .insert(Header {
            key: ROUTING_KEY,
            value: Some(routing_key),
        })
        .insert(Header {
            key: DELIVERY_COUNT,
            value: Some(delivery_count.as_str()),
        })
}

/// Headers for a dead-lettered copy of a record.
#[must_use]
pub fn dead_letter_headers(
    routing_key: &str,
    delivery_count: u32,
    exchange: &str,
    reason: &str,
    envelope: Option<&Envelope>,
) -> OwnedHeaders {
    let headers = match envelope {
        Some(envelope) => envelope_headers(envelope, routing_key, delivery_count),
        None => {
            let delivery_count = delivery_count.to_string();
            OwnedHeaders::new()
                .insert(Header {
                    key: ROUTING_KEY,
                    value: Some(routing_key),
                })
                .insert(Header {
                    key: DELIVERY_COUNT,
                    value: Some(delivery_count.as_str()),
                })
        }
    };

    headers
        .insert(Header {
            key: ORIGINAL_EXCHANGE,
            value: Some(exchange),
        })
        .insert(Header {
            key: DEAD_LETTER_REASON,
            value: Some(reason),
        })
}

/// Last value of header `key` as UTF-8.
#[must_use]
pub fn header_str<'a, H: Headers>(headers: &'a H, key: &str) -> Option<&'a str> {
    (0..headers.count())
        .rev()
        .filter_map(|idx| headers.try_get(idx))
        .find(|header| header.key == key)
        .and_then(|header| header.value)
        .and_then(|value| std::str::from_utf8(value).ok())
}

/// Delivery count from the headers; records without one are first deliveries.
#[must_use]
pub fn delivery_count<H: Headers>(headers: Option<&H>) -> u32 {
    headers
        .and_then(|h| header_str(h, DELIVERY_COUNT))
        .and_then(|value| value.parse().ok())
        .filter(|count| *count > 0)
        .unwrap_or(1)
}
