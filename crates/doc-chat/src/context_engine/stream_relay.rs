//! Forwards provider deltas to the caller's body sink while keeping a running
//! copy of the full answer.

use bytes::Bytes;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::providers::{ProviderEvent, ProviderStream};
use crate::session_store::UsageInfo;

/// Body sink of a streamed response. An `Err` item aborts the HTTP body.
pub type ChunkSender = mpsc::Sender<Result<Bytes, std::io::Error>>;

#[derive(Debug, Clone, PartialEq)]
pub struct RelayOutcome {
    pub full_text: String,
    pub usage: Option<UsageInfo>,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("provider reported an error mid-stream: {0}")]
    Provider(String),

    #[error("provider transport failed: {0}")]
    Transport(String),

    #[error("caller disconnected")]
    SinkClosed,
}

/// Consume `events` exactly once. On any error the partial text is dropped and
/// the sink is closed before the error is returned.
pub async fn relay(mut events: ProviderStream, sink: ChunkSender) -> Result<RelayOutcome, RelayError> {
    let mut full_text = String::new();
    let mut usage = None;

    while let Some(event) = events.next().await {
        match event {
            Ok(ProviderEvent::Delta(text)) => {
                if text.is_empty() {
                    continue;
                }
                if sink.send(Ok(Bytes::from(text.clone()))).await.is_err() {
                    warn!("Caller went away after {} chars", full_text.len());
                    return Err(RelayError::SinkClosed);
                }
                full_text.push_str(&text);
            }
            Ok(ProviderEvent::UsageOnly(info)) => usage = Some(info),
            Ok(ProviderEvent::Done) => break,
            Ok(ProviderEvent::ProviderError(message)) => {
                return Err(abort(sink, RelayError::Provider(message)).await);
            }
            Err(e) => {
                return Err(abort(sink, RelayError::Transport(e.to_string())).await);
            }
        }
    }

    debug!("Relay finished with {} chars", full_text.len());
    Ok(RelayOutcome { full_text, usage })
}

async fn abort(sink: ChunkSender, error: RelayError) -> RelayError {
    let _ = sink
        .send(Err(std::io::Error::new(std::io::ErrorKind::Other, error.to_string())))
        .await;
    drop(sink);
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn events(items: Vec<anyhow::Result<ProviderEvent>>) -> ProviderStream {
        stream::iter(items).boxed()
    }

    async fn drain(mut rx: mpsc::Receiver<Result<Bytes, std::io::Error>>) -> (Vec<String>, usize) {
        let mut chunks = Vec::new();
        let mut errors = 0;
        while let Some(item) = rx.recv().await {
            match item {
                Ok(bytes) => chunks.push(String::from_utf8(bytes.to_vec()).unwrap()),
                Err(_) => errors += 1,
            }
        }
        (chunks, errors)
    }

    #[tokio::test]
    async fn test_forwards_chunks_and_keeps_last_usage() {
        let (tx, rx) = mpsc::channel(16);
        let first = UsageInfo { prompt_tokens: 1, completion_tokens: 1, total_tokens: 2 };
        let last = UsageInfo { prompt_tokens: 10, completion_tokens: 4, total_tokens: 14 };

        let outcome = relay(
            events(vec![
                Ok(ProviderEvent::Delta("Sec".into())),
                Ok(ProviderEvent::UsageOnly(first)),
                Ok(ProviderEvent::Delta(String::new())),
                Ok(ProviderEvent::Delta("tion 2".into())),
                Ok(ProviderEvent::UsageOnly(last)),
                Ok(ProviderEvent::Done),
                Ok(ProviderEvent::Delta("ignored".into())),
            ]),
            tx,
        )
        .await
        .unwrap();

        assert_eq!(outcome.full_text, "Section 2");
        assert_eq!(outcome.usage, Some(last));
        assert_eq!(drain(rx).await, (vec!["Sec".to_string(), "tion 2".to_string()], 0));
    }

    #[tokio::test]
    async fn test_stream_without_done_still_completes() {
        let (tx, _rx) = mpsc::channel(4);
        let outcome = relay(events(vec![Ok(ProviderEvent::Delta("hi".into()))]), tx).await.unwrap();
        assert_eq!(outcome, RelayOutcome { full_text: "hi".into(), usage: None });
    }

    #[tokio::test]
    async fn test_transport_error_closes_sink_with_error_item() {
        let (tx, rx) = mpsc::channel(16);
        let result = relay(
            events(vec![
                Ok(ProviderEvent::Delta("Hel".into())),
                Err(anyhow::anyhow!("connection reset")),
                Ok(ProviderEvent::Delta("lo".into())),
            ]),
            tx,
        )
        .await;

        assert!(matches!(result, Err(RelayError::Transport(ref m)) if m.contains("connection reset")));
        assert_eq!(drain(rx).await, (vec!["Hel".to_string()], 1));
    }

    #[tokio::test]
    async fn test_provider_error_event_is_reported() {
        let (tx, rx) = mpsc::channel(16);
        let result = relay(events(vec![Ok(ProviderEvent::ProviderError("overloaded".into()))]), tx).await;
        assert!(matches!(result, Err(RelayError::Provider(_))));
        assert_eq!(drain(rx).await.1, 1);
    }

    #[tokio::test]
    async fn test_closed_sink_stops_relay() {
        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        let result = relay(events(vec![Ok(ProviderEvent::Delta("x".into()))]), tx).await;
        assert!(matches!(result, Err(RelayError::SinkClosed)));
    }
}
