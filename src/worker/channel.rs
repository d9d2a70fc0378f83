//! Request/response + notification channel to the worker.
//!
//! Two pipes are bound to the worker: the producer pipe carries host -> worker requests, the
//! consumer pipe carries worker -> host responses, notifications and log lines. Messages are
//! JSON bodies in netstring frames; log frames are distinguished by their first byte.

use crate::messages::Request;
use crate::worker::common::{EventHandlers, SubscriptionHandler};
use crate::worker::netstring;
use async_executor::Executor;
use async_fs::File;
use futures_lite::{AsyncReadExt, AsyncWriteExt};
use log::*;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

const READ_CHUNK_SIZE: usize = 65_536;

/// Error that caused a request to the worker to fail.
#[derive(Debug, Error)]
pub enum RequestError {
    /// Channel already closed.
    #[error("Channel already closed")]
    ChannelClosed,
    /// The serialized request frame exceeds the maximum frame size.
    #[error("Request message is too big")]
    MessageTooBig,
    /// Received response error.
    #[error("Received response error: {reason}")]
    Response {
        /// Rejection reason sent by the worker.
        reason: String,
    },
    /// Failed to parse response from worker.
    #[error("Failed to parse response from worker: {error}")]
    FailedToParse {
        /// Parse error description.
        error: String,
    },
}

/// Error that caused a notification to the worker to fail.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// Channel already closed.
    #[error("Channel already closed")]
    ChannelClosed,
    /// The serialized notification frame or its payload exceeds the maximum frame size.
    #[error("Notification message is too big")]
    MessageTooBig,
}

/// Non-protocol frames arriving on the consumer pipe: worker log lines and anything
/// undecodable.
#[derive(Debug)]
pub(crate) enum InternalMessage {
    /// Debug log.
    Debug(String),
    /// Warn log.
    Warn(String),
    /// Error log.
    Error(String),
    /// Dump log.
    Dump(String),
    /// Unknown data.
    Unexpected(Vec<u8>),
}

struct ResponseError {
    reason: String,
}

type Response = Result<Option<Value>, ResponseError>;

#[derive(Default)]
struct RequestsContainer {
    next_id: u32,
    senders: HashMap<u32, async_oneshot::Sender<Response>>,
}

type BufferedNotifications = Arc<Mutex<Option<Vec<(String, Value)>>>>;

/// While this guard is alive, incoming notifications are queued instead of dispatched;
/// dropping it flushes the queue to the subscribers registered by then. Used to bridge the gap
/// between worker startup and the readiness subscription.
pub(crate) struct BufferMessagesGuard {
    buffered_notifications: BufferedNotifications,
    event_handlers: EventHandlers<Value>,
}

impl Drop for BufferMessagesGuard {
    fn drop(&mut self) {
        if let Some(notifications) = self.buffered_notifications.lock().take() {
            for (target_id, notification) in notifications {
                self.event_handlers
                    .call_callbacks_with_value(&target_id, notification);
            }
        }
    }
}

struct Inner {
    sender: async_channel::Sender<Vec<u8>>,
    internal_message_receiver: async_channel::Receiver<InternalMessage>,
    requests_container: Arc<Mutex<RequestsContainer>>,
    event_handlers: EventHandlers<Value>,
    buffered_notifications: BufferedNotifications,
    closed: Arc<AtomicBool>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.close();
        self.internal_message_receiver.close();
    }
}

impl Inner {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Reject pending requests; dropping the senders resolves the receivers with a
            // closed error that surfaces as `RequestError::ChannelClosed`.
            self.requests_container.lock().senders.clear();
            self.sender.close();
        }
    }
}

/// Channel to the worker over a pair of pipes: requests with correlated responses plus
/// worker-originated notifications demultiplexed by target id.
#[derive(Clone)]
pub(crate) struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    pub(crate) fn new(executor: Arc<Executor<'static>>, reader: File, writer: File) -> Self {
        let requests_container = Arc::<Mutex<RequestsContainer>>::default();
        let event_handlers = EventHandlers::<Value>::new();
        let buffered_notifications = BufferedNotifications::default();
        let closed = Arc::new(AtomicBool::new(false));

        let internal_message_receiver = {
            let requests_container = Arc::clone(&requests_container);
            let event_handlers = event_handlers.clone();
            let buffered_notifications = Arc::clone(&buffered_notifications);
            let closed = Arc::clone(&closed);
            let (sender, receiver) = async_channel::unbounded();

            executor
                .spawn(read_loop(
                    reader,
                    requests_container,
                    event_handlers,
                    buffered_notifications,
                    closed,
                    sender,
                ))
                .detach();

            receiver
        };

        let sender = {
            let (sender, receiver) = async_channel::unbounded::<Vec<u8>>();

            executor
                .spawn(async move {
                    let mut writer = writer;
                    let mut bytes = Vec::with_capacity(netstring::NS_MESSAGE_MAX_LEN);
                    while let Ok(message) = receiver.recv().await {
                        bytes.clear();
                        netstring::encode_into(&mut bytes, &message);

                        if writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }

                    io::Result::Ok(())
                })
                .detach();

            sender
        };

        let inner = Arc::new(Inner {
            sender,
            internal_message_receiver,
            requests_container,
            event_handlers,
            buffered_notifications,
            closed,
        });

        Self { inner }
    }

    /// Queue incoming notifications until the returned guard is dropped. Must be activated
    /// before the worker process is spawned so nothing can slip past it.
    pub(crate) fn buffer_messages(&self) -> BufferMessagesGuard {
        self.inner.buffered_notifications.lock().replace(Vec::new());

        BufferMessagesGuard {
            buffered_notifications: Arc::clone(&self.inner.buffered_notifications),
            event_handlers: self.inner.event_handlers.clone(),
        }
    }

    pub(crate) fn get_internal_message_receiver(
        &self,
    ) -> async_channel::Receiver<InternalMessage> {
        self.inner.internal_message_receiver.clone()
    }

    /// Issue a request addressed to the worker-side object identified by `handler_id` (empty
    /// for worker-scoped methods) and await its response.
    pub(crate) async fn request<R>(
        &self,
        handler_id: &str,
        request: R,
    ) -> Result<R::Response, RequestError>
    where
        R: Request,
    {
        let method = request.as_method();

        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RequestError::ChannelClosed);
        }

        let (result_sender, result_receiver) = async_oneshot::oneshot();

        let id = {
            let mut requests_container = self.inner.requests_container.lock();

            // The id namespace is monotonic and wraps just below 2^32 - 1, starting over at 1.
            requests_container.next_id = if requests_container.next_id < u32::MAX {
                requests_container.next_id + 1
            } else {
                1
            };
            let id = requests_container.next_id;
            requests_container.senders.insert(id, result_sender);

            id
        };

        debug!("request() [method:{}, id:{}]", method, id);

        let serialized_message = serde_json::to_vec(&RequestMessage {
            id,
            method,
            handler_id,
            data: &request,
        })
        .map_err(|error| RequestError::FailedToParse {
            error: error.to_string(),
        })?;

        // +2 for the colon and comma, the frame must stay within the message cap.
        if serialized_message.len() + serialized_message.len().to_string().len() + 2
            > netstring::NS_MESSAGE_MAX_LEN
        {
            self.inner.requests_container.lock().senders.remove(&id);
            return Err(RequestError::MessageTooBig);
        }

        if self.inner.sender.send(serialized_message).await.is_err() {
            self.inner.requests_container.lock().senders.remove(&id);
            return Err(RequestError::ChannelClosed);
        }

        let response = result_receiver
            .await
            .map_err(|_closed| RequestError::ChannelClosed)?;

        match response {
            Ok(data) => {
                debug!("request succeeded [method:{}, id:{}]", method, id);

                serde_json::from_value(data.unwrap_or(Value::Null)).map_err(|error| {
                    RequestError::FailedToParse {
                        error: error.to_string(),
                    }
                })
            }
            Err(ResponseError { reason }) => {
                debug!(
                    "request failed [method:{}, id:{}]: {}",
                    method, id, reason,
                );

                Err(RequestError::Response { reason })
            }
        }
    }

    /// Subscribe to notifications whose target id matches; the callback receives the
    /// notification object with the target id stripped (`{event, data?}`).
    pub(crate) fn subscribe_to_notifications<F>(
        &self,
        target_id: String,
        callback: F,
    ) -> SubscriptionHandler
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.inner.event_handlers.add(target_id, callback)
    }

    /// Close is idempotent: pending requests reject with `ChannelClosed` and new requests are
    /// refused. The reader task keeps draining the pipe until EOF so late worker notifications
    /// are absorbed rather than treated as protocol errors.
    pub(crate) fn close(&self) {
        self.inner.close();
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestMessage<'a, R: Serialize> {
    id: u32,
    method: &'static str,
    #[serde(skip_serializing_if = "str_is_empty")]
    handler_id: &'a str,
    data: &'a R,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn str_is_empty(string: &&str) -> bool {
    string.is_empty()
}

async fn read_loop(
    mut reader: File,
    requests_container: Arc<Mutex<RequestsContainer>>,
    event_handlers: EventHandlers<Value>,
    buffered_notifications: BufferedNotifications,
    closed: Arc<AtomicBool>,
    internal_message_sender: async_channel::Sender<InternalMessage>,
) -> io::Result<()> {
    let mut decoder = netstring::Decoder::new();
    let mut read_buffer = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let read_bytes = reader.read(&mut read_buffer).await?;
        if read_bytes == 0 {
            // EOF, the worker side ended.
            break;
        }

        decoder.feed(&read_buffer[..read_bytes]);

        loop {
            let frame = match decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(error) => {
                    // An undecodable frame makes the whole pipe unrecoverable.
                    error!("channel frame decode error, closing: {}", error);
                    return Ok(());
                }
            };

            if closed.load(Ordering::SeqCst) {
                // Absorb anything the worker wrote after close.
                continue;
            }

            process_frame(
                &frame,
                &requests_container,
                &event_handlers,
                &buffered_notifications,
                &internal_message_sender,
            )
            .await;
        }
    }

    io::Result::Ok(())
}

async fn process_frame(
    frame: &[u8],
    requests_container: &Mutex<RequestsContainer>,
    event_handlers: &EventHandlers<Value>,
    buffered_notifications: &BufferedNotifications,
    internal_message_sender: &async_channel::Sender<InternalMessage>,
) {
    match frame.first() {
        Some(b'{') => match serde_json::from_slice::<Value>(frame) {
            Ok(message) => {
                process_json_message(
                    message,
                    requests_container,
                    event_handlers,
                    buffered_notifications,
                );
            }
            Err(error) => {
                error!("received invalid JSON message: {}", error);
            }
        },
        Some(b'D') => {
            let _ = internal_message_sender
                .send(InternalMessage::Debug(log_text(frame)))
                .await;
        }
        Some(b'W') => {
            let _ = internal_message_sender
                .send(InternalMessage::Warn(log_text(frame)))
                .await;
        }
        Some(b'E') => {
            let _ = internal_message_sender
                .send(InternalMessage::Error(log_text(frame)))
                .await;
        }
        Some(b'X') => {
            let _ = internal_message_sender
                .send(InternalMessage::Dump(log_text(frame)))
                .await;
        }
        _ => {
            let _ = internal_message_sender
                .send(InternalMessage::Unexpected(frame.to_vec()))
                .await;
        }
    }
}

fn process_json_message(
    message: Value,
    requests_container: &Mutex<RequestsContainer>,
    event_handlers: &EventHandlers<Value>,
    buffered_notifications: &BufferedNotifications,
) {
    let object = match message {
        Value::Object(object) => object,
        _ => {
            error!("received JSON message is not an object");
            return;
        }
    };

    // A response carries the id of the request it completes.
    if let Some(id) = object.get("id").and_then(Value::as_u64) {
        let id = id as u32;
        let sender = requests_container.lock().senders.remove(&id);
        let sender = match sender {
            Some(sender) => sender,
            None => {
                warn!("received response does not match any sent request [id:{}]", id);
                return;
            }
        };

        if object.get("accepted").and_then(Value::as_bool) == Some(true) {
            let _ = sender.send(Ok(object.get("data").cloned()));
        } else {
            let reason = object
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("unknown reason")
                .to_string();
            let _ = sender.send(Err(ResponseError { reason }));
        }

        return;
    }

    // A notification is dispatched to the object owning its target id.
    let mut object = object;
    let target_id = object.remove("targetId");
    let target_id = match target_id {
        Some(Value::String(target_id)) => target_id,
        Some(Value::Number(target_id)) => target_id.to_string(),
        _ => {
            error!("received message is not a response nor a notification");
            return;
        }
    };

    if object.contains_key("event") {
        let notification = Value::Object(object);

        if let Some(queue) = buffered_notifications.lock().as_mut() {
            queue.push((target_id, notification));
            return;
        }

        event_handlers.call_callbacks_with_value(&target_id, notification);
    } else {
        error!("received notification without event [target_id:{}]", target_id);
    }
}

fn log_text(frame: &[u8]) -> String {
    String::from_utf8_lossy(&frame[1..]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::utils::duplex_pipe_pair;
    use futures_lite::future;
    use serde::Deserialize;
    use std::io::{Read, Write};
    use std::thread;

    #[derive(Debug, Serialize)]
    struct TestRequest {
        foo: u32,
    }

    #[derive(Debug, Deserialize, Eq, PartialEq)]
    struct TestResponse {
        bar: u32,
    }

    impl Request for TestRequest {
        type Response = TestResponse;

        fn as_method(&self) -> &'static str {
            "test.echo"
        }
    }

    fn setup() -> (
        Arc<Executor<'static>>,
        async_oneshot::Sender<()>,
        Channel,
        std::fs::File,
        std::fs::File,
    ) {
        let executor = Arc::new(Executor::new());
        let (stop_sender, stop_receiver) = async_oneshot::oneshot::<()>();
        {
            let executor = Arc::clone(&executor);
            thread::spawn(move || {
                let _ = future::block_on(executor.run(stop_receiver));
            });
        }

        // Host-side reader is the remote writer and vice versa.
        let ((channel_reader, remote_writer), (remote_reader, channel_writer)) =
            duplex_pipe_pair();

        let channel = Channel::new(Arc::clone(&executor), channel_reader, channel_writer);

        (executor, stop_sender, channel, remote_reader, remote_writer)
    }

    fn read_frame(reader: &mut std::fs::File) -> Vec<u8> {
        let mut decoder = netstring::Decoder::new();
        let mut byte = [0u8; 1];
        loop {
            reader.read_exact(&mut byte).unwrap();
            decoder.feed(&byte);
            if let Some(frame) = decoder.next_frame().unwrap() {
                return frame;
            }
        }
    }

    fn write_frame(writer: &mut std::fs::File, body: &[u8]) {
        let mut bytes = Vec::new();
        netstring::encode_into(&mut bytes, body);
        writer.write_all(&bytes).unwrap();
    }

    #[test]
    fn request_response_correlation() {
        let (_executor, _stop_sender, channel, mut remote_reader, mut remote_writer) = setup();

        // The remote side acknowledges every request it reads, out of order on purpose.
        let responder = thread::spawn(move || {
            let mut requests = Vec::new();
            for _ in 0..2 {
                let frame = read_frame(&mut remote_reader);
                let message = serde_json::from_slice::<Value>(&frame).unwrap();
                assert_eq!(message["method"], "test.echo");
                requests.push(message);
            }

            for message in requests.iter().rev() {
                let response = serde_json::json!({
                    "id": message["id"],
                    "accepted": true,
                    "data": { "bar": message["data"]["foo"] },
                });
                write_frame(&mut remote_writer, response.to_string().as_bytes());
            }
        });

        let (first, second) = future::block_on(async {
            futures_lite::future::zip(
                channel.request("", TestRequest { foo: 1 }),
                channel.request("", TestRequest { foo: 2 }),
            )
            .await
        });

        assert_eq!(first.unwrap(), TestResponse { bar: 1 });
        assert_eq!(second.unwrap(), TestResponse { bar: 2 });

        responder.join().unwrap();
    }

    #[test]
    fn rejected_request_carries_reason() {
        let (_executor, _stop_sender, channel, mut remote_reader, mut remote_writer) = setup();

        thread::spawn(move || {
            let frame = read_frame(&mut remote_reader);
            let message = serde_json::from_slice::<Value>(&frame).unwrap();
            let response = serde_json::json!({
                "id": message["id"],
                "rejected": true,
                "reason": "not today",
            });
            write_frame(&mut remote_writer, response.to_string().as_bytes());
        });

        let result = future::block_on(channel.request("", TestRequest { foo: 1 }));
        match result {
            Err(RequestError::Response { reason }) => assert_eq!(reason, "not today"),
            result => panic!("unexpected result: {:?}", result),
        }
    }

    #[test]
    fn notifications_are_demultiplexed_by_target_id() {
        let (_executor, _stop_sender, channel, _remote_reader, mut remote_writer) = setup();

        let (notification_sender, notification_receiver) = async_channel::unbounded::<Value>();
        let _handler = channel.subscribe_to_notifications("some-id".to_string(), {
            move |notification| {
                let _ = notification_sender.try_send(notification);
            }
        });

        write_frame(
            &mut remote_writer,
            br#"{"targetId":"some-id","event":"score","data":{"score":10}}"#,
        );
        write_frame(
            &mut remote_writer,
            br#"{"targetId":"other-id","event":"score","data":{"score":0}}"#,
        );

        let notification = future::block_on(notification_receiver.recv()).unwrap();
        assert_eq!(notification["event"], "score");
        assert_eq!(notification["data"]["score"], 10);
        // The target id is stripped before dispatch.
        assert!(notification.get("targetId").is_none());
    }

    #[test]
    fn close_rejects_pending_and_new_requests() {
        let (_executor, _stop_sender, channel, mut remote_reader, _remote_writer) = setup();

        let pending = {
            let channel = channel.clone();
            thread::spawn(move || {
                future::block_on(channel.request("", TestRequest { foo: 1 }))
            })
        };

        // Wait for the request frame so the pending entry exists before closing.
        let _frame = read_frame(&mut remote_reader);
        channel.close();

        assert!(matches!(
            pending.join().unwrap(),
            Err(RequestError::ChannelClosed),
        ));
        assert!(matches!(
            future::block_on(channel.request("", TestRequest { foo: 2 })),
            Err(RequestError::ChannelClosed),
        ));
    }

    #[test]
    fn log_frames_become_internal_messages() {
        let (_executor, _stop_sender, channel, _remote_reader, mut remote_writer) = setup();

        write_frame(&mut remote_writer, b"Dworker started");
        write_frame(&mut remote_writer, b"Esomething failed");

        let receiver = channel.get_internal_message_receiver();
        match future::block_on(receiver.recv()).unwrap() {
            InternalMessage::Debug(text) => assert_eq!(text, "worker started"),
            message => panic!("unexpected message: {:?}", message),
        }
        match future::block_on(receiver.recv()).unwrap() {
            InternalMessage::Error(text) => assert_eq!(text, "something failed"),
            message => panic!("unexpected message: {:?}", message),
        }
    }
}
