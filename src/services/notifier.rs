//! Best-effort push delivery to players and stores.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{dao::repositories::ProfileRepository, state::SharedState};

/// Message shown on the recipient's device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushMessage {
    /// Notification title.
    pub title: String,
    /// Notification text.
    pub body: String,
    /// Opaque payload forwarded to the client app.
    pub data: Value,
}

/// Recipient of a push, with the device token when one is registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTarget {
    /// Recipient.
    pub user_id: String,
    /// Recipient's device token, if any.
    pub push_token: Option<String>,
}

/// Failure to hand a message to the push provider.
#[derive(Debug, Error)]
pub enum PushError {
    /// The push service could not be reached.
    #[cfg(feature = "expo-push")]
    #[error("failed to reach push provider")]
    Transport {
        /// Underlying failure.
        #[source]
        source: reqwest::Error,
    },
    /// The push service refused the message.
    #[error("push provider rejected the message with status {status}")]
    Rejected {
        /// HTTP status returned.
        status: u16,
    },
}

/// Outbound channel for device notifications.
pub trait NotificationSink: Send + Sync {
    /// Send one message to one device.
    fn deliver(
        &self,
        target: PushTarget,
        message: PushMessage,
    ) -> BoxFuture<'static, Result<(), PushError>>;
}

/// Sink that only records the message in the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn deliver(
        &self,
        target: PushTarget,
        message: PushMessage,
    ) -> BoxFuture<'static, Result<(), PushError>> {
        info!(
            user_id = %target.user_id,
            has_token = target.push_token.is_some(),
            title = %message.title,
            body = %message.body,
            "push notification"
        );
        Box::pin(futures::future::ready(Ok(())))
    }
}

#[cfg(feature = "expo-push")]
pub use expo::ExpoPushSink;

#[cfg(feature = "expo-push")]
mod expo {
    use futures::future::BoxFuture;
    use reqwest::Client;
    use serde::Serialize;
    use serde_json::Value;

    use super::{NotificationSink, PushError, PushMessage, PushTarget};

    const DEFAULT_EXPO_PUSH_URL: &str = "https://exp.host/--/api/v2/push/send";

    #[derive(Serialize)]
    struct ExpoMessage<'a> {
        to: &'a str,
        title: &'a str,
        body: &'a str,
        data: &'a Value,
        sound: &'static str,
    }

    /// Sends messages through the Expo push service.
    #[derive(Clone)]
    pub struct ExpoPushSink {
        client: Client,
        url: String,
    }

    impl ExpoPushSink {
        /// Sink posting to `url`.
        pub fn new(url: impl Into<String>) -> Self {
            Self {
                client: Client::new(),
                url: url.into(),
            }
        }

        /// Read `EXPO_PUSH_URL`, falling back to the public Expo endpoint.
        pub fn from_env() -> Self {
            let url =
                std::env::var("EXPO_PUSH_URL").unwrap_or_else(|_| DEFAULT_EXPO_PUSH_URL.into());
            Self::new(url)
        }
    }

    impl NotificationSink for ExpoPushSink {
        fn deliver(
            &self,
            target: PushTarget,
            message: PushMessage,
        ) -> BoxFuture<'static, Result<(), PushError>> {
            let sink = self.clone();
            Box::pin(async move {
                let Some(token) = target.push_token else {
                    tracing::debug!(user_id = %target.user_id, "no push token registered");
                    return Ok(());
                };

                let payload = ExpoMessage {
                    to: &token,
                    title: &message.title,
                    body: &message.body,
                    data: &message.data,
                    sound: "default",
                };
                let response = sink
                    .client
                    .post(&sink.url)
                    .json(&payload)
                    .send()
                    .await
                    .map_err(|source| PushError::Transport { source })?;

                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(PushError::Rejected {
                        status: response.status().as_u16(),
                    })
                }
            })
        }
    }
}

/// Look up the recipient's push token and deliver `message` in the background.
///
/// Never fails the caller: lookup and delivery errors are logged and dropped.
pub fn push_to_user(state: &SharedState, user_id: &str, message: PushMessage) {
    let state = Arc::clone(state);
    let user_id = user_id.to_owned();

    tokio::spawn(async move {
        let push_token = match state.store().await {
            Some(store) => match ProfileRepository::new(store).find(&user_id).await {
                Ok(profile) => profile.and_then(|profile| profile.push_token),
                Err(err) => {
                    warn!(user_id = %user_id, error = %err, "failed to load push token");
                    None
                }
            },
            None => None,
        };

        let target = PushTarget {
            user_id: user_id.clone(),
            push_token,
        };
        match state.notifier().deliver(target, message).await {
            Ok(()) => debug!(user_id = %user_id, "push delivered"),
            Err(err) => warn!(user_id = %user_id, error = %err, "push delivery failed"),
        }
    });
}
