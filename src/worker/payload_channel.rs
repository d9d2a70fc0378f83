//! Payload channel to the worker: notifications carrying raw byte payloads.
//!
//! Every message is a pair of consecutive netstring frames on the same pipe: frame A is the
//! JSON notification meta (`{targetId, event, data?}`), frame B is the raw payload. Both
//! directions use the same two-frame convention; there are no requests on this channel.

use crate::messages::PayloadNotification;
use crate::worker::common::{EventHandlers, SubscriptionHandler};
use crate::worker::netstring;
use crate::worker::NotificationError;
use async_executor::Executor;
use async_fs::File;
use bytes::Bytes;
use futures_lite::{AsyncReadExt, AsyncWriteExt};
use log::*;
use serde::Serialize;
use serde_json::Value;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const READ_CHUNK_SIZE: usize = 65_536;

/// Notification meta plus its payload bytes as delivered to subscribers.
#[derive(Debug, Clone)]
pub(crate) struct NotificationMessage {
    /// Notification object with the target id stripped (`{event, data?}`).
    pub(crate) message: Value,
    /// Raw payload bytes of the second frame.
    pub(crate) payload: Bytes,
}

struct MessageWithPayload {
    message: Vec<u8>,
    payload: Bytes,
}

struct Inner {
    sender: async_channel::Sender<MessageWithPayload>,
    event_handlers: EventHandlers<NotificationMessage>,
    closed: Arc<AtomicBool>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.sender.close();
        }
    }
}

#[derive(Clone)]
pub(crate) struct PayloadChannel {
    inner: Arc<Inner>,
}

impl PayloadChannel {
    pub(crate) fn new(executor: Arc<Executor<'static>>, reader: File, writer: File) -> Self {
        let event_handlers = EventHandlers::<NotificationMessage>::new();
        let closed = Arc::new(AtomicBool::new(false));

        {
            let event_handlers = event_handlers.clone();
            let closed = Arc::clone(&closed);

            executor
                .spawn(read_loop(reader, event_handlers, closed))
                .detach();
        }

        let sender = {
            let (sender, receiver) = async_channel::unbounded::<MessageWithPayload>();

            // A single writer task drains whole pairs, so the two frames of a notification
            // are never interleaved with other frames on the pipe.
            executor
                .spawn(async move {
                    let mut writer = writer;
                    let mut bytes = Vec::with_capacity(netstring::NS_MESSAGE_MAX_LEN);
                    while let Ok(message) = receiver.recv().await {
                        bytes.clear();
                        netstring::encode_into(&mut bytes, &message.message);
                        netstring::encode_into(&mut bytes, &message.payload);

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
            event_handlers,
            closed,
        });

        Self { inner }
    }

    /// Send a payload notification addressed to the worker-side object identified by
    /// `target_id`.
    pub(crate) async fn notify<N>(
        &self,
        target_id: &str,
        notification: N,
        payload: Bytes,
    ) -> Result<(), NotificationError>
    where
        N: PayloadNotification,
    {
        let event = notification.as_event();

        debug!("notify() [event:{}]", event);

        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(NotificationError::ChannelClosed);
        }

        let serialized_message = serde_json::to_vec(&NotificationMessageOut {
            target_id,
            event,
            data: &notification,
        })
        .map_err(|_| NotificationError::MessageTooBig)?;

        if serialized_message.len() > netstring::NS_PAYLOAD_MAX_LEN
            || payload.len() > netstring::NS_PAYLOAD_MAX_LEN
        {
            return Err(NotificationError::MessageTooBig);
        }

        self.inner
            .sender
            .send(MessageWithPayload {
                message: serialized_message,
                payload,
            })
            .await
            .map_err(|_| NotificationError::ChannelClosed)
    }

    /// Subscribe to payload notifications whose target id matches.
    pub(crate) fn subscribe_to_notifications<F>(
        &self,
        target_id: String,
        callback: F,
    ) -> SubscriptionHandler
    where
        F: Fn(NotificationMessage) + Send + Sync + 'static,
    {
        self.inner.event_handlers.add(target_id, callback)
    }

    pub(crate) fn close(&self) {
        self.inner.close();
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NotificationMessageOut<'a, N: Serialize> {
    target_id: &'a str,
    event: &'static str,
    data: &'a N,
}

// The two-frame protocol is stateful per pipe: the meta frame is held until the very next
// frame supplies its payload. Any malformed frame drops the in-flight meta.
enum ReadState {
    AwaitingMeta,
    AwaitingPayload { target_id: String, message: Value },
}

async fn read_loop(
    mut reader: File,
    event_handlers: EventHandlers<NotificationMessage>,
    closed: Arc<AtomicBool>,
) -> io::Result<()> {
    let mut decoder = netstring::Decoder::new();
    let mut read_buffer = vec![0u8; READ_CHUNK_SIZE];
    let mut state = ReadState::AwaitingMeta;

    loop {
        let read_bytes = reader.read(&mut read_buffer).await?;
        if read_bytes == 0 {
            break;
        }

        decoder.feed(&read_buffer[..read_bytes]);

        loop {
            let frame = match decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(error) => {
                    warn!("payload channel frame decode error: {}", error);
                    state = ReadState::AwaitingMeta;
                    continue;
                }
            };

            if closed.load(Ordering::SeqCst) {
                continue;
            }

            state = match state {
                ReadState::AwaitingMeta => match parse_meta(&frame) {
                    Some((target_id, message)) => {
                        ReadState::AwaitingPayload { target_id, message }
                    }
                    None => {
                        error!(
                            "received invalid payload notification meta: {}",
                            String::from_utf8_lossy(&frame),
                        );
                        ReadState::AwaitingMeta
                    }
                },
                ReadState::AwaitingPayload { target_id, message } => {
                    event_handlers.call_callbacks_with_value(
                        &target_id,
                        NotificationMessage {
                            message,
                            payload: Bytes::from(frame),
                        },
                    );
                    ReadState::AwaitingMeta
                }
            };
        }
    }

    io::Result::Ok(())
}

fn parse_meta(frame: &[u8]) -> Option<(String, Value)> {
    let message = serde_json::from_slice::<Value>(frame).ok()?;
    let mut object = match message {
        Value::Object(object) => object,
        _ => return None,
    };

    let target_id = match object.remove("targetId") {
        Some(Value::String(target_id)) => target_id,
        _ => return None,
    };

    object.get("event")?;

    Some((target_id, Value::Object(object)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::utils::duplex_pipe_pair;
    use futures_lite::future;
    use std::io::{Read, Write};
    use std::thread;

    #[derive(Debug, Serialize)]
    struct TestNotification {
        ppid: u32,
    }

    impl PayloadNotification for TestNotification {
        fn as_event(&self) -> &'static str {
            "test.send"
        }
    }

    fn setup() -> (
        Arc<Executor<'static>>,
        async_oneshot::Sender<()>,
        PayloadChannel,
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

        let ((channel_reader, remote_writer), (remote_reader, channel_writer)) =
            duplex_pipe_pair();

        let payload_channel =
            PayloadChannel::new(Arc::clone(&executor), channel_reader, channel_writer);

        (
            executor,
            stop_sender,
            payload_channel,
            remote_reader,
            remote_writer,
        )
    }

    fn write_frame(writer: &mut std::fs::File, body: &[u8]) {
        let mut bytes = Vec::new();
        netstring::encode_into(&mut bytes, body);
        writer.write_all(&bytes).unwrap();
    }

    #[test]
    fn two_frame_notification_is_delivered() {
        let (_executor, _stop_sender, payload_channel, _remote_reader, mut remote_writer) =
            setup();

        let (sender, receiver) = async_channel::unbounded::<NotificationMessage>();
        let _handler =
            payload_channel.subscribe_to_notifications("data-consumer-id".to_string(), {
                move |notification| {
                    let _ = sender.try_send(notification);
                }
            });

        write_frame(
            &mut remote_writer,
            br#"{"targetId":"data-consumer-id","event":"message","data":{"ppid":51}}"#,
        );
        write_frame(&mut remote_writer, b"payload bytes");

        let notification = future::block_on(receiver.recv()).unwrap();
        assert_eq!(notification.message["event"], "message");
        assert_eq!(notification.message["data"]["ppid"], 51);
        assert_eq!(notification.payload, Bytes::from_static(b"payload bytes"));
    }

    #[test]
    fn invalid_meta_resets_pairing() {
        let (_executor, _stop_sender, payload_channel, _remote_reader, mut remote_writer) =
            setup();

        let (sender, receiver) = async_channel::unbounded::<NotificationMessage>();
        let _handler = payload_channel.subscribe_to_notifications("target".to_string(), {
            move |notification| {
                let _ = sender.try_send(notification);
            }
        });

        // Garbage meta is dropped without consuming the pairing slot.
        write_frame(&mut remote_writer, b"not json at all");
        write_frame(
            &mut remote_writer,
            br#"{"targetId":"target","event":"message","data":{"ppid":53}}"#,
        );
        write_frame(&mut remote_writer, &[1, 2, 3]);

        let notification = future::block_on(receiver.recv()).unwrap();
        assert_eq!(notification.message["data"]["ppid"], 53);
        assert_eq!(notification.payload, Bytes::from_static(&[1, 2, 3]));
    }

    #[test]
    fn notify_writes_meta_and_payload_back_to_back() {
        let (_executor, _stop_sender, payload_channel, mut remote_reader, _remote_writer) =
            setup();

        future::block_on(payload_channel.notify(
            "data-producer-id",
            TestNotification { ppid: 51 },
            Bytes::from_static(b"hello"),
        ))
        .unwrap();

        let mut decoder = netstring::Decoder::new();
        let mut frames = Vec::new();
        let mut byte = [0u8; 1];
        while frames.len() < 2 {
            remote_reader.read_exact(&mut byte).unwrap();
            decoder.feed(&byte);
            if let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(frame);
            }
        }

        let meta = serde_json::from_slice::<Value>(&frames[0]).unwrap();
        assert_eq!(meta["targetId"], "data-producer-id");
        assert_eq!(meta["event"], "test.send");
        assert_eq!(meta["data"]["ppid"], 51);
        assert_eq!(frames[1], b"hello".to_vec());
    }
}
