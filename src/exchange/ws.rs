//! WebSocket text feed shared by the streaming adapters
//!
//! Connects, optionally sends one subscription frame, keeps the socket alive
//! with pings and forwards text frames. The returned stream ends when the
//! server closes the connection; callers treat that as a reconnect trigger.

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tungstenite::Message;
use tracing::{debug, info, warn};

use super::FeedStream;
use crate::error::{Error, Result};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const FORWARD_BUFFER: usize = 1024;

/// Open `url` and stream its text frames
pub async fn connect_text_stream(url: &str, subscribe: Option<String>) -> Result<FeedStream<String>> {
    let parsed = url::Url::parse(url)
        .map_err(|e| Error::Config(format!("Invalid WebSocket URL {}: {}", url, e)))?;

    let (ws_stream, _) = connect_async(parsed.as_str()).await?;
    info!(url = %parsed, "WebSocket connected");

    let (mut write, mut read) = ws_stream.split();

    if let Some(frame) = subscribe {
        write.send(Message::Text(frame)).await?;
        debug!(url = %parsed, "Subscription sent");
    }

    let (tx, rx) = mpsc::channel::<Result<String>>(FORWARD_BUFFER);
    let label = parsed.to_string();

    tokio::spawn(async move {
        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.tick().await;

        loop {
            tokio::select! {
                _ = ping_timer.tick() => {
                    if let Err(e) = write.send(Message::Ping(vec![])).await {
                        warn!(url = %label, error = %e, "Failed to send ping");
                        let _ = tx.send(Err(e.into())).await;
                        break;
                    }
                }

                _ = tx.closed() => {
                    debug!(url = %label, "Consumer dropped, closing socket");
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if tx.send(Ok(text)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!(url = %label, "WebSocket closed by server");
                            break;
                        }
                        Some(Err(e)) => {
                            let _ = tx.send(Err(e.into())).await;
                            break;
                        }
                        None => {
                            info!(url = %label, "WebSocket stream ended");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    Ok(stream.boxed())
}

/// Decode each text frame into zero or more items.
///
/// Transport errors and decode errors are both forwarded so the consuming
/// worker can reconnect.
pub fn decode_frames<T, F>(frames: FeedStream<String>, mut parse: F) -> FeedStream<T>
where
    T: Send + 'static,
    F: FnMut(&str) -> Result<Vec<T>> + Send + 'static,
{
    frames
        .flat_map(move |frame| {
            let items: Vec<Result<T>> = match frame.and_then(|text| parse(&text)) {
                Ok(items) => items.into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            };
            futures::stream::iter(items)
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_decode_frames_expands_and_forwards_errors() {
        let frames: FeedStream<String> = futures::stream::iter(vec![
            Ok("1,2".to_string()),
            Ok(String::new()),
            Err(Error::WebSocket("reset".into())),
        ])
        .boxed();

        let decoded = decode_frames(frames, |text| {
            text.split(',')
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<u32>().map_err(|e| Error::Decode(e.to_string())))
                .collect()
        });
        let items: Vec<Result<u32>> = decoded.collect().await;

        assert_eq!(items.len(), 3);
        assert_eq!(*items[0].as_ref().unwrap(), 1);
        assert_eq!(*items[1].as_ref().unwrap(), 2);
        assert!(matches!(items[2], Err(Error::WebSocket(_))));
    }
}
