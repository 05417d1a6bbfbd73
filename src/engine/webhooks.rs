//! Completion notifications for workflows and batches.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{RetryConfig, WebhookEvent};
use crate::error::{Error, Result};
use crate::retry::with_retry;
use crate::types::{BatchId, Event, WebhookPayload, WorkflowId};

use super::{Engine, lock};

const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Completion target a per-submission hook is attached to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum HookTarget {
    Workflow(WorkflowId),
    Batch(BatchId),
}

/// Callback invoked once when a submission reaches a terminal status
#[derive(Clone)]
pub enum CompletionHook {
    /// POST the payload as JSON to a URL
    Url {
        /// Endpoint
        url: String,
        /// Optional `Authorization` header value
        auth_header: Option<String>,
    },
    /// Call an in-process function
    Callback(Arc<dyn Fn(WebhookPayload) + Send + Sync>),
}

impl CompletionHook {
    /// Hook that POSTs to `url`
    pub fn url(url: impl Into<String>) -> Self {
        CompletionHook::Url {
            url: url.into(),
            auth_header: None,
        }
    }

    /// Hook that calls `f` with the completion payload
    pub fn callback(f: impl Fn(WebhookPayload) + Send + Sync + 'static) -> Self {
        CompletionHook::Callback(Arc::new(f))
    }
}

impl std::fmt::Debug for CompletionHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionHook::Url { url, .. } => f.debug_struct("Url").field("url", url).finish_non_exhaustive(),
            CompletionHook::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// One outgoing POST
struct WebhookDelivery {
    url: String,
    auth_header: Option<String>,
    timeout: Duration,
}

impl Engine {
    /// Fire the per-submission hook (at most once) and every configured
    /// webhook subscribed to `event`
    ///
    /// HTTP deliveries run in the background (fire and forget); failures are
    /// logged and surfaced as [`Event::WebhookFailed`].
    pub(crate) fn notify_completion(
        &self,
        target: HookTarget,
        event: WebhookEvent,
        payload: WebhookPayload,
    ) {
        let mut deliveries: Vec<WebhookDelivery> = self
            .config
            .notifications
            .webhooks
            .iter()
            .filter(|w| w.events.contains(&event))
            .map(|w| WebhookDelivery {
                url: w.url.clone(),
                auth_header: w.auth_header.clone(),
                timeout: w.timeout,
            })
            .collect();

        // removal makes the hook fire once even if completion is reported twice
        let hook = lock(&self.runtime.hooks).remove(&target);
        match hook {
            Some(CompletionHook::Callback(f)) => f(payload.clone()),
            Some(CompletionHook::Url { url, auth_header }) => deliveries.push(WebhookDelivery {
                url,
                auth_header,
                timeout: DEFAULT_HOOK_TIMEOUT,
            }),
            None => {}
        }

        if deliveries.is_empty() {
            return;
        }

        let event_tx = self.event_tx.clone();
        let retry = self.config.retry.clone();
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            let payload = Arc::new(payload);

            for delivery in deliveries {
                match post_webhook(&client, &delivery, &payload, &retry).await {
                    Ok(()) => tracing::debug!(url = %delivery.url, "webhook sent successfully"),
                    Err(e) => {
                        let error = e.to_string();
                        tracing::warn!(url = %delivery.url, error = %error, "webhook failed");
                        event_tx
                            .send(Event::WebhookFailed {
                                url: delivery.url,
                                error,
                            })
                            .ok();
                    }
                }
            }
        });
    }
}

/// POST the payload, retrying timeouts, connection errors and 5xx/429 responses
async fn post_webhook(
    client: &reqwest::Client,
    delivery: &WebhookDelivery,
    payload: &WebhookPayload,
    retry: &RetryConfig,
) -> Result<()> {
    with_retry(retry, || async {
        let mut request = client
            .post(&delivery.url)
            .json(payload)
            .timeout(delivery.timeout);
        if let Some(auth) = &delivery.auth_header {
            request = request.header("Authorization", auth);
        }
        request
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map(|_| ())
            .map_err(Error::Network)
    })
    .await
}
