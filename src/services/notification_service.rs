use std::{convert::Infallible, time::Duration};

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    dao::{
        models::MailboxEntity,
        repositories::{MailboxRepository, ProfileRepository},
    },
    dto::notification::MailboxResponse,
    error::ServiceError,
    state::SharedState,
};

/// Event name carried by every mailbox update on the stream.
const MAILBOX_EVENT: &str = "mailbox";

/// Unread notifications of `user_id`, oldest first.
pub async fn list(state: &SharedState, user_id: &str) -> Result<MailboxEntity, ServiceError> {
    let store = state.require_store().await?;
    Ok(MailboxRepository::new(store).find(user_id).await?)
}

/// Mark one notification as read by removing it from the mailbox.
pub async fn dismiss(
    state: &SharedState,
    user_id: &str,
    notification_id: Uuid,
) -> Result<MailboxEntity, ServiceError> {
    let store = state.require_store().await?;
    let mailboxes = MailboxRepository::new(store);

    match mailboxes
        .modify(user_id, |mailbox| mailbox.remove(notification_id).is_some())
        .await?
    {
        Some(mailbox) => Ok(mailbox),
        None => Err(ServiceError::NotFound(format!(
            "notification `{notification_id}` not found"
        ))),
    }
}

/// Register or clear the device token used to push to `user_id`.
pub async fn save_push_token(
    state: &SharedState,
    user_id: &str,
    push_token: Option<String>,
) -> Result<(), ServiceError> {
    let store = state.require_store().await?;
    ProfileRepository::new(store)
        .save_push_token(user_id, push_token)
        .await?;
    Ok(())
}

/// Stream the mailbox of `user_id` as server-sent events: its current content,
/// then every later version.
pub async fn watch(
    state: &SharedState,
    user_id: &str,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>> + use<>>, ServiceError> {
    let store = state.require_store().await?;
    let mut changes = MailboxRepository::new(store).watch(user_id);
    let user_id = user_id.to_owned();

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(8);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                change = changes.next() => {
                    let Some(change) = change else { break };
                    let mailbox = match change {
                        Ok(mailbox) => mailbox,
                        Err(err) => {
                            warn!(user_id = %user_id, error = %err, "mailbox watch failed");
                            break;
                        }
                    };

                    let event = match Event::default()
                        .event(MAILBOX_EVENT)
                        .json_data(MailboxResponse::from(mailbox))
                    {
                        Ok(event) => event,
                        Err(err) => {
                            warn!(user_id = %user_id, error = %err, "failed to encode mailbox event");
                            continue;
                        }
                    };

                    if tx.send(Ok(event)).await.is_err() {
                        break;
                    }
                }
            }
        }

        info!(user_id = %user_id, "notification stream disconnected");
    });

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}
