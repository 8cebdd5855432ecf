//! # HTTP notifier.
//!
//! POSTs the event in CloudEvents structured mode
//! (`Content-Type: application/cloudevents+json`) to the reply target URL.
//! Any 2xx response is an acknowledgement.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, header};

use super::notify::{Delivery, Notifier, OutboundEvent};
use crate::error::ClientError;

const CLOUDEVENTS_JSON: &str = "application/cloudevents+json";

/// [`Notifier`] over `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpNotifier {
    client: reqwest::Client,
}

impl HttpNotifier {
    /// Builds a notifier whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Transport {
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, event: &OutboundEvent, target: &str) -> Result<Delivery, ClientError> {
        let resp = self
            .client
            .post(target)
            .header(header::CONTENT_TYPE, CLOUDEVENTS_JSON)
            .json(event)
            .send()
            .await
            .map_err(|e| ClientError::Transport {
                reason: e.to_string(),
            })?;
        Ok(classify(resp.status()))
    }
}

fn classify(status: StatusCode) -> Delivery {
    if status.is_success() {
        Delivery::Ack
    } else {
        Delivery::Nack(format!("receiver answered {status}"))
    }
}
