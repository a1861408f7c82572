//! WebSocket update streaming
//!
//! After the upgrade, every batch of entries committed past the client's
//! position is sent as one binary message. The stream ends when the client
//! goes away or the datastore is destroyed.

use axum::extract::ws::{Message, WebSocket};
use std::sync::Arc;
use tracing::{debug, error};
use zinc_storage::DatastoreOperations;

/// Commit time announced when a datastore is destroyed
const DESTROYED: i64 = i64::MAX;

pub async fn stream_updates(
    mut socket: WebSocket,
    ops: Arc<DatastoreOperations>,
    updated_after: i64,
) {
    let mut after = updated_after;
    loop {
        // Subscribe before reading so a commit landing in between still wakes us
        let notified = ops.subscribe(after);

        let reader = Arc::clone(&ops);
        let updates = match tokio::task::spawn_blocking(move || reader.read_updates(after)).await
        {
            Ok(Ok(updates)) => updates,
            Ok(Err(e)) => {
                debug!("Closing update stream for {}: {e}", ops.name());
                break;
            }
            Err(e) => {
                error!("Storage task failed: {e}");
                break;
            }
        };

        if !updates.data.is_empty()
            && socket
                .send(Message::Binary(updates.data.into()))
                .await
                .is_err()
        {
            return;
        }
        after = updates.last_modified;

        tokio::select! {
            notified = notified => match notified {
                Ok(DESTROYED) | Err(_) => break,
                Ok(_) => {}
            },
            message = socket.recv() => match message {
                None | Some(Err(_) | Ok(Message::Close(_))) => return,
                Some(Ok(_)) => {}
            },
        }
    }
    // Peer may already be gone
    let _ = socket.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use crate::handlers::{AppState, router};
    use crate::registry::ServerRegistry;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use futures::StreamExt;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;
    use tower::ServiceExt;
    use zinc_storage::{Entry, deserialize_entries, serialize_entries};

    const WAIT: Duration = Duration::from_secs(5);

    async fn serve() -> (TempDir, Arc<AppState>, SocketAddr) {
        let dir = tempdir().unwrap();
        let registry = Arc::new(ServerRegistry::open(dir.path()).unwrap());
        let state = Arc::new(AppState::new(registry));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::clone(&state)).into_make_service_with_connect_info::<SocketAddr>();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (dir, state, addr)
    }

    async fn request(state: &Arc<AppState>, method: &str, body: Vec<u8>) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri("/datastore/d1")
            .body(Body::from(body))
            .unwrap();
        let response = router(Arc::clone(state)).oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn post(state: &Arc<AppState>, key: &str) -> i64 {
        let entries = serialize_entries(&[Entry::json(format!("\"{key}\""), "1")]);
        let (status, body) = request(state, "POST", entries).await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        value["commitTimestamp"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_stream_sends_each_commit_then_closes_on_delete() {
        let (_dir, state, addr) = serve().await;
        let created = post(&state, "a").await;

        let url = format!("ws://{addr}/datastore/d1?updatedAfter={created}");
        let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        for key in ["b", "c"] {
            let commit = post(&state, key).await;
            let message = tokio::time::timeout(WAIT, client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let ClientMessage::Binary(data) = message else {
                panic!("expected a binary message, got {message:?}");
            };
            let entries = deserialize_entries(&data).unwrap();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].key, format!("\"{key}\"").into_bytes());
            assert_eq!(entries[0].primary_header.commit_time, commit);

            // Nothing else until the next commit
            assert!(
                tokio::time::timeout(Duration::from_millis(100), client.next())
                    .await
                    .is_err()
            );
        }

        let (status, _) = request(&state, "DELETE", Vec::new()).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let last = tokio::time::timeout(WAIT, client.next()).await.unwrap();
        assert!(matches!(last, None | Some(Ok(ClientMessage::Close(_)))));
    }

    #[tokio::test]
    async fn test_stream_starts_with_existing_entries() {
        let (_dir, state, addr) = serve().await;
        let commit = post(&state, "a").await;

        let url = format!("ws://{addr}/datastore/d1");
        let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let message = tokio::time::timeout(WAIT, client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let ClientMessage::Binary(data) = message else {
            panic!("expected a binary message, got {message:?}");
        };
        // Head entry, then the posted transaction
        let entries = deserialize_entries(&data).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].key.is_empty());
        assert_eq!(entries[1].primary_header.commit_time, commit);
    }
}
