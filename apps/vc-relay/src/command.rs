use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tracing::trace;
use uuid::Uuid;

use crate::protocol::{CommandRequest, SubscribeRequest};

/// Frames handed to the data-source socket writer task.
#[derive(Debug)]
pub enum SocketFrame {
    Text(String),
    Close,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum CommandError {
    #[error("command channel is closed")]
    ChannelClosed,
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("command failed with status {status}: {message}")]
    Failed { status: i32, message: String },
    #[error("failed to encode command envelope: {0}")]
    Encode(String),
}

type PendingReply = oneshot::Sender<Result<String, CommandError>>;

/// Request/response RPC over a single duplex WebSocket to the data source.
///
/// Outbound commands are wrapped in a versioned envelope with a fresh
/// correlation ID; inbound `commandResponse` messages are matched back to
/// the pending request by that ID. Each request settles exactly once:
/// either with the response body or with a timeout.
pub struct CommandChannel {
    outbound: mpsc::UnboundedSender<SocketFrame>,
    pending: DashMap<Uuid, PendingReply>,
}

impl CommandChannel {
    pub fn new(outbound: mpsc::UnboundedSender<SocketFrame>) -> Self {
        Self {
            outbound,
            pending: DashMap::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Send the one-off event-subscription envelope. No response expected.
    pub fn subscribe_command_responses(&self) -> Result<(), CommandError> {
        let frame = serde_json::to_string(&SubscribeRequest::command_responses())
            .map_err(|e| CommandError::Encode(e.to_string()))?;
        self.outbound
            .send(SocketFrame::Text(frame))
            .map_err(|_| CommandError::ChannelClosed)
    }

    /// Issue a command and wait for its correlated response or the deadline.
    ///
    /// Any number of requests may be in flight concurrently; responses may
    /// arrive in any order. A non-zero status code rejects with
    /// `CommandError::Failed`.
    pub async fn send(&self, command_line: &str, deadline: Duration) -> Result<String, CommandError> {
        if self.outbound.is_closed() {
            return Err(CommandError::ChannelClosed);
        }

        let (request_id, request) = CommandRequest::new(command_line);
        let frame =
            serde_json::to_string(&request).map_err(|e| CommandError::Encode(e.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(request_id, reply_tx);

        if self.outbound.send(SocketFrame::Text(frame)).is_err() {
            self.pending.remove(&request_id);
            return Err(CommandError::ChannelClosed);
        }

        match timeout(deadline, reply_rx).await {
            Ok(Ok(result)) => result,
            // Reply sender dropped without resolving: channel torn down.
            Ok(Err(_)) => Err(CommandError::ChannelClosed),
            Err(_) => {
                // A response arriving after this point finds no pending
                // entry and is silently dropped.
                self.pending.remove(&request_id);
                Err(CommandError::Timeout(deadline))
            }
        }
    }

    /// Settle the pending request matching `request_id`, if any. Unmatched
    /// or already-settled correlation IDs are dropped.
    pub fn resolve(&self, request_id: Uuid, status_code: i32, status_message: String) {
        match self.pending.remove(&request_id) {
            Some((_, reply_tx)) => {
                let result = if status_code == 0 {
                    Ok(status_message)
                } else {
                    Err(CommandError::Failed {
                        status: status_code,
                        message: status_message,
                    })
                };
                // The caller may have timed out in the meantime.
                let _ = reply_tx.send(result);
            }
            None => {
                trace!(%request_id, "dropping response with no pending request");
            }
        }
    }

    /// Reject every in-flight request and ask the writer to close the
    /// socket. Idempotent.
    pub fn shutdown(&self) {
        self.pending.clear();
        let _ = self.outbound.send(SocketFrame::Close);
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{parse_data_source_message, DataSourceMessage};
    use serde_json::json;

    fn channel() -> (CommandChannel, mpsc::UnboundedReceiver<SocketFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CommandChannel::new(tx), rx)
    }

    /// Pull the next outbound frame and extract its correlation ID.
    fn sent_request_id(rx: &mut mpsc::UnboundedReceiver<SocketFrame>) -> Uuid {
        match rx.try_recv().unwrap() {
            SocketFrame::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                value["header"]["requestId"]
                    .as_str()
                    .unwrap()
                    .parse()
                    .unwrap()
            }
            SocketFrame::Close => panic!("expected a text frame"),
        }
    }

    #[tokio::test]
    async fn test_success_response_resolves() {
        let (channel, mut rx) = channel();
        let channel = std::sync::Arc::new(channel);

        let sender = channel.clone();
        let call = tokio::spawn(async move {
            sender.send("getlocalplayername", Duration::from_secs(1)).await
        });

        // Wait for the request to hit the wire, then answer it.
        tokio::task::yield_now().await;
        let request_id = sent_request_id(&mut rx);
        channel.resolve(request_id, 0, "Alice".to_string());

        assert_eq!(call.await.unwrap(), Ok("Alice".to_string()));
        assert_eq!(channel.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_nonzero_status_rejects() {
        let (channel, mut rx) = channel();
        let channel = std::sync::Arc::new(channel);

        let sender = channel.clone();
        let call =
            tokio::spawn(async move { sender.send("vcserver:sync true", Duration::from_secs(1)).await });

        tokio::task::yield_now().await;
        let request_id = sent_request_id(&mut rx);
        channel.resolve(request_id, 7, "no such command".to_string());

        assert_eq!(
            call.await.unwrap(),
            Err(CommandError::Failed {
                status: 7,
                message: "no such command".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let (channel, mut rx) = channel();
        let channel = std::sync::Arc::new(channel);

        let first = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.send("first", Duration::from_secs(1)).await })
        };
        tokio::task::yield_now().await;
        let first_id = sent_request_id(&mut rx);

        let second = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.send("second", Duration::from_secs(1)).await })
        };
        tokio::task::yield_now().await;
        let second_id = sent_request_id(&mut rx);

        // Answer in reverse order; correlation must still hold.
        channel.resolve(second_id, 0, "two".to_string());
        channel.resolve(first_id, 0, "one".to_string());

        assert_eq!(first.await.unwrap(), Ok("one".to_string()));
        assert_eq!(second.await.unwrap(), Ok("two".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects_and_late_response_is_dropped() {
        let (channel, mut rx) = channel();
        let channel = std::sync::Arc::new(channel);

        let sender = channel.clone();
        let call = tokio::spawn(async move {
            sender.send("vcserver:sync false", Duration::from_millis(500)).await
        });

        tokio::task::yield_now().await;
        let request_id = sent_request_id(&mut rx);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(
            call.await.unwrap(),
            Err(CommandError::Timeout(Duration::from_millis(500)))
        );
        assert_eq!(channel.pending_len(), 0);

        // Late arrival settles nothing and must not panic.
        channel.resolve(request_id, 0, "late".to_string());
        assert_eq!(channel.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_closed_channel_fails_fast() {
        let (channel, rx) = channel();
        drop(rx);

        let result = channel.send("anything", Duration::from_secs(1)).await;
        assert_eq!(result, Err(CommandError::ChannelClosed));
        assert_eq!(channel.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_request_id_is_dropped() {
        let (channel, _rx) = channel();
        channel.resolve(Uuid::new_v4(), 0, "nobody asked".to_string());
        assert_eq!(channel.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_in_flight_requests() {
        let (channel, mut rx) = channel();
        let channel = std::sync::Arc::new(channel);

        let sender = channel.clone();
        let call =
            tokio::spawn(async move { sender.send("vcserver:sync true", Duration::from_secs(5)).await });
        tokio::task::yield_now().await;
        let _ = sent_request_id(&mut rx);

        channel.shutdown();
        assert_eq!(call.await.unwrap(), Err(CommandError::ChannelClosed));
        assert!(matches!(rx.try_recv(), Ok(SocketFrame::Close)));
    }

    #[tokio::test]
    async fn test_wire_roundtrip_through_parser() {
        let (channel, mut rx) = channel();
        let channel = std::sync::Arc::new(channel);

        let sender = channel.clone();
        let call = tokio::spawn(async move {
            sender.send("vcserver:notifyplayer Bob ABCDE QRST", Duration::from_secs(1)).await
        });

        tokio::task::yield_now().await;
        let request_id = sent_request_id(&mut rx);

        // Simulate the data source echoing a response frame.
        let response = json!({
            "header": { "messagePurpose": "commandResponse", "requestId": request_id },
            "body": { "statusCode": 0, "statusMessage": "delivered" },
        })
        .to_string();
        match parse_data_source_message(&response).unwrap() {
            DataSourceMessage::CommandResponse {
                request_id,
                status_code,
                status_message,
            } => channel.resolve(request_id, status_code, status_message),
        }

        assert_eq!(call.await.unwrap(), Ok("delivered".to_string()));
    }
}
