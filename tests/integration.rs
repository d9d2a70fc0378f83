//! End-to-end scenarios against a scripted stand-in for the media worker.
//!
//! The fake worker is this very binary re-executed with `SWITCHBOARD_FAKE_WORKER` set: it
//! honors the inherited fd contract (3 = requests in, 4 = responses/notifications out,
//! 5/6 = payload channel), performs the readiness handshake and answers every request of the
//! protocol, which lets the whole supervisor/IPC/object-lifecycle machinery run for real
//! without the native data-plane.

use futures_lite::future;
use std::env;
use std::panic;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchboard::consumer::ConsumerOptions;
use switchboard::data_consumer::DataConsumerOptions;
use switchboard::data_producer::{DataProducer, DataProducerOptions};
use switchboard::data_structures::{TransportListenIp, WebRtcMessage};
use switchboard::producer::ProducerOptions;
use switchboard::router::{PipeToRouterOptions, Router, RouterOptions};
use switchboard::rtp_observer::{RtpObserver, RtpObserverAddProducerOptions};
use switchboard::rtp_parameters::{
    MediaKind, MimeType, MimeTypeAudio, MimeTypeVideo, RtcpParameters, RtpCapabilities,
    RtpCodecCapability, RtpCodecParameters, RtpCodecParametersParameters,
    RtpEncodingParameters, RtpParameters,
};
use switchboard::transport::Transport;
use switchboard::webrtc_transport::{TransportListenIps, WebRtcTransportOptions};
use switchboard::worker::{CreateRouterError, Worker, WorkerSettings};
use switchboard::worker_manager::WorkerManager;
use switchboard::audio_level_observer::AudioLevelObserverOptions;
use std::num::{NonZeroU32, NonZeroU8};

const FAKE_WORKER_ENV: &str = "SWITCHBOARD_FAKE_WORKER";

fn main() {
    if env::var_os(FAKE_WORKER_ENV).is_some() {
        fake_worker::run();
        return;
    }

    {
        let mut builder = env_logger::builder();
        if env::var(env_logger::DEFAULT_FILTER_ENV).is_err() {
            builder.filter_level(log::LevelFilter::Off);
        }
        let _ = builder.is_test(true).try_init();
    }

    // Children of this process become fake workers.
    env::set_var(FAKE_WORKER_ENV, "1");

    let tests: &[(&str, fn())] = &[
        ("worker_spawn_ready_and_dump", worker_spawn_ready_and_dump),
        ("router_rtp_capabilities", router_rtp_capabilities),
        (
            "produce_consume_payload_type_remap",
            produce_consume_payload_type_remap,
        ),
        ("cascading_close", cascading_close),
        ("channel_request_flood", channel_request_flood),
        ("worker_death_detection", worker_death_detection),
        ("direct_data_round_trip", direct_data_round_trip),
        ("pipe_producer_to_router", pipe_producer_to_router),
        (
            "audio_level_observer_volumes",
            audio_level_observer_volumes,
        ),
        (
            "consumer_closes_on_producer_close",
            consumer_closes_on_producer_close,
        ),
    ];

    let mut failed = 0;
    for (name, test) in tests {
        print!("test {} ... ", name);
        match panic::catch_unwind(test) {
            Ok(()) => println!("ok"),
            Err(_) => {
                failed += 1;
                println!("FAILED");
            }
        }
    }

    println!(
        "\ntest result: {}. {} passed; {} failed",
        if failed == 0 { "ok" } else { "FAILED" },
        tests.len() - failed,
        failed,
    );

    if failed > 0 {
        process::exit(1);
    }
}

fn worker_manager() -> WorkerManager {
    WorkerManager::new(env::current_exe().expect("Failed to get current exe path"))
}

fn media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: None,
            clock_rate: NonZeroU32::new(48000).unwrap(),
            channels: NonZeroU8::new(2).unwrap(),
            parameters: RtpCodecParametersParameters::from([("useinbandfec", 1_u32.into())]),
            rtcp_feedback: vec![],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp8,
            preferred_payload_type: None,
            clock_rate: NonZeroU32::new(90000).unwrap(),
            parameters: RtpCodecParametersParameters::new(),
            rtcp_feedback: vec![],
        },
    ]
}

fn audio_producer_options() -> ProducerOptions {
    ProducerOptions::new(
        MediaKind::Audio,
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters::Audio {
                mime_type: MimeTypeAudio::Opus,
                payload_type: 111,
                clock_rate: NonZeroU32::new(48000).unwrap(),
                channels: NonZeroU8::new(2).unwrap(),
                parameters: RtpCodecParametersParameters::from([(
                    "useinbandfec",
                    1_u32.into(),
                )]),
                rtcp_feedback: vec![],
            }],
            header_extensions: vec![],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(1111),
                ..RtpEncodingParameters::default()
            }],
            rtcp: RtcpParameters::default(),
        },
    )
}

fn consuming_device_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: Some(100),
            clock_rate: NonZeroU32::new(48000).unwrap(),
            channels: NonZeroU8::new(2).unwrap(),
            parameters: RtpCodecParametersParameters::new(),
            rtcp_feedback: vec![],
        }],
        header_extensions: vec![],
    }
}

fn setup() -> (WorkerManager, Worker, Router) {
    let worker_manager = worker_manager();

    let (worker, router) = future::block_on(async {
        let worker = worker_manager
            .create_worker(WorkerSettings::default())
            .await
            .expect("Failed to create worker");

        let router = worker
            .create_router(RouterOptions::new(media_codecs()))
            .await
            .expect("Failed to create router");

        (worker, router)
    });

    (worker_manager, worker, router)
}

fn wait_until(description: &str, condition: impl Fn() -> bool) {
    let started = Instant::now();
    while !condition() {
        if started.elapsed() > Duration::from_secs(5) {
            panic!("timed out waiting for: {}", description);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn worker_spawn_ready_and_dump() {
    let worker_manager = worker_manager();

    future::block_on(async move {
        let worker = worker_manager
            .create_worker(WorkerSettings::default())
            .await
            .expect("Failed to create worker");

        let dump = worker.dump().await.expect("Failed to dump worker");
        assert_eq!(dump.pid, worker.pid());

        let usage = worker
            .get_resource_usage()
            .await
            .expect("Failed to get resource usage");
        assert_eq!(usage.ru_nsignals, 0);

        worker
            .update_settings(Default::default())
            .await
            .expect("Failed to update settings");
    });
}

fn router_rtp_capabilities() {
    let (_worker_manager, _worker, router) = setup();

    let caps = router.rtp_capabilities();

    // Opus, VP8 and the VP8 RTX companion codec.
    assert_eq!(caps.codecs.len(), 3);

    let opus_pt = caps.codecs[0].preferred_payload_type().unwrap();
    assert!((96..=127).contains(&opus_pt));

    let vp8 = &caps.codecs[1];
    assert_eq!(vp8.mime_type(), MimeType::Video(MimeTypeVideo::Vp8));

    let rtx = &caps.codecs[2];
    assert_eq!(rtx.mime_type(), MimeType::Video(MimeTypeVideo::Rtx));
}

fn produce_consume_payload_type_remap() {
    let (_worker_manager, _worker, router) = setup();

    future::block_on(async move {
        let transport = router
            .create_webrtc_transport(WebRtcTransportOptions::new(TransportListenIps::new(
                TransportListenIp {
                    ip: "127.0.0.1".parse().unwrap(),
                    announced_ip: None,
                },
            )))
            .await
            .expect("Failed to create WebRTC transport");

        let producer = transport
            .produce(audio_producer_options())
            .await
            .expect("Failed to produce");

        assert_eq!(producer.rtp_parameters().codecs[0].payload_type(), 111);
        // The producer got the transport-level CNAME filled in.
        assert!(producer.rtp_parameters().rtcp.cname.is_some());

        assert!(router.can_consume(&producer.id(), &consuming_device_capabilities()));

        let consumer = transport
            .consume(ConsumerOptions::new(
                producer.id(),
                consuming_device_capabilities(),
            ))
            .await
            .expect("Failed to consume");

        // Payload type is the endpoint capability one, not the producer's original 111.
        assert_eq!(consumer.rtp_parameters().codecs[0].payload_type(), 100);
        assert_eq!(consumer.rtp_parameters().mid.as_deref(), Some("0"));
        assert_eq!(consumer.producer_id(), producer.id());

        // MID counter is monotonic across consumers of the same transport.
        let second_consumer = transport
            .consume(ConsumerOptions::new(
                producer.id(),
                consuming_device_capabilities(),
            ))
            .await
            .expect("Failed to consume");
        assert_eq!(second_consumer.rtp_parameters().mid.as_deref(), Some("1"));
    });
}

fn cascading_close() {
    let (_worker_manager, _worker, router) = setup();

    future::block_on(async move {
        let transport = router
            .create_webrtc_transport(WebRtcTransportOptions::new(TransportListenIps::new(
                TransportListenIp {
                    ip: "127.0.0.1".parse().unwrap(),
                    announced_ip: None,
                },
            )))
            .await
            .expect("Failed to create WebRTC transport");

        let producer = transport
            .produce(audio_producer_options())
            .await
            .expect("Failed to produce");

        let router_closed = Arc::new(AtomicUsize::new(0));
        let transport_closed = Arc::new(AtomicUsize::new(0));
        let producer_closed = Arc::new(AtomicUsize::new(0));

        let _router_close_handler = router.on_close({
            let router_closed = Arc::clone(&router_closed);
            move || {
                router_closed.fetch_add(1, Ordering::SeqCst);
            }
        });
        let _transport_close_handler = transport.on_close(Box::new({
            let transport_closed = Arc::clone(&transport_closed);
            move || {
                transport_closed.fetch_add(1, Ordering::SeqCst);
            }
        }));
        let _producer_close_handler = producer.on_close({
            let producer_closed = Arc::clone(&producer_closed);
            move || {
                producer_closed.fetch_add(1, Ordering::SeqCst);
            }
        });

        router.close();

        // The whole subtree is closed synchronously, each observer exactly once.
        assert!(router.closed());
        assert!(transport.closed());
        assert!(producer.closed());
        assert_eq!(router_closed.load(Ordering::SeqCst), 1);
        assert_eq!(transport_closed.load(Ordering::SeqCst), 1);
        assert_eq!(producer_closed.load(Ordering::SeqCst), 1);

        // Closing again changes nothing.
        router.close();
        assert_eq!(router_closed.load(Ordering::SeqCst), 1);

        // New operations on the closed subtree are refused locally.
        assert!(transport.produce(audio_producer_options()).await.is_err());
    });
}

fn channel_request_flood() {
    let worker_manager = worker_manager();

    let worker = future::block_on(async {
        worker_manager
            .create_worker(WorkerSettings::default())
            .await
            .expect("Failed to create worker")
    });

    // 1000 requests in flight from 40 threads; every single one must complete.
    let threads = (0..40)
        .map(|_| {
            let worker = worker.clone();
            std::thread::spawn(move || {
                for _ in 0..25 {
                    let dump = future::block_on(worker.dump()).expect("Failed to dump");
                    assert_eq!(dump.pid, worker.pid());
                }
            })
        })
        .collect::<Vec<_>>();

    for thread in threads {
        thread.join().expect("Worker thread panicked");
    }
}

fn worker_death_detection() {
    let worker_manager = worker_manager();

    let worker = future::block_on(async {
        worker_manager
            .create_worker(WorkerSettings::default())
            .await
            .expect("Failed to create worker")
    });

    let died = Arc::new(AtomicUsize::new(0));
    let _on_dead_handler = worker.on_dead({
        let died = Arc::clone(&died);
        move |_exit_error| {
            died.fetch_add(1, Ordering::SeqCst);
        }
    });

    let kill_status = process::Command::new("kill")
        .arg("-9")
        .arg(worker.pid().to_string())
        .status()
        .expect("Failed to run kill");
    assert!(kill_status.success());

    wait_until("worker to be closed after being killed", || worker.closed());
    wait_until("died callback", || died.load(Ordering::SeqCst) == 1);

    // Anything after death is refused before reaching the (gone) worker.
    let result = future::block_on(worker.create_router(RouterOptions::new(media_codecs())));
    assert!(matches!(result, Err(CreateRouterError::WorkerClosed)));
}

fn direct_data_round_trip() {
    let (_worker_manager, _worker, router) = setup();

    future::block_on(async move {
        let transport = router
            .create_direct_transport(Default::default())
            .await
            .expect("Failed to create direct transport");

        let data_producer = transport
            .produce_data(DataProducerOptions::new_direct())
            .await
            .expect("Failed to produce data");

        let data_consumer = transport
            .consume_data(DataConsumerOptions::new_direct(data_producer.id()))
            .await
            .expect("Failed to consume data");

        let (message_sender, message_receiver) = async_channel_pair();
        let _message_handler = data_consumer.on_message(move |message| {
            if let WebRtcMessage::String(string) = message {
                let _ = message_sender.try_send(string.clone());
            }
        });

        match &data_producer {
            DataProducer::Direct(direct_data_producer) => {
                direct_data_producer
                    .send(WebRtcMessage::String("hello through the worker".to_string()))
                    .await
                    .expect("Failed to send");
            }
            _ => panic!("Expected a direct data producer"),
        }

        // The fake worker loops the message back to the data consumer.
        let received = message_receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("No message received");
        assert_eq!(received, "hello through the worker");
    });
}

fn pipe_producer_to_router() {
    let worker_manager = worker_manager();

    future::block_on(async move {
        let worker = worker_manager
            .create_worker(WorkerSettings::default())
            .await
            .expect("Failed to create worker");

        let router_a = worker
            .create_router(RouterOptions::new(media_codecs()))
            .await
            .expect("Failed to create router");
        let router_b = worker
            .create_router(RouterOptions::new(media_codecs()))
            .await
            .expect("Failed to create router");

        let transport = router_a
            .create_webrtc_transport(WebRtcTransportOptions::new(TransportListenIps::new(
                TransportListenIp {
                    ip: "127.0.0.1".parse().unwrap(),
                    announced_ip: None,
                },
            )))
            .await
            .expect("Failed to create WebRTC transport");

        let producer = transport
            .produce(audio_producer_options())
            .await
            .expect("Failed to produce");

        let pair = router_a
            .pipe_producer_to_router(
                producer.id(),
                PipeToRouterOptions::new(router_b.clone()),
            )
            .await
            .expect("Failed to pipe producer");

        // The destination side reuses the id of the source producer.
        let pipe_producer = pair.pipe_producer.into_inner();
        assert_eq!(pipe_producer.id(), producer.id());
        assert_eq!(pair.pipe_consumer.producer_id(), producer.id());

        // Piping to the same router is refused.
        assert!(router_a
            .pipe_producer_to_router(
                producer.id(),
                PipeToRouterOptions::new(router_a.clone()),
            )
            .await
            .is_err());

        // A second producer shares the memoized pipe transport pair.
        let second_producer = transport
            .produce({
                let mut options = audio_producer_options();
                options.rtp_parameters.mid = Some("1".to_string());
                options.rtp_parameters.encodings[0].ssrc = Some(2222);
                options
            })
            .await
            .expect("Failed to produce");

        let second_pair = router_a
            .pipe_producer_to_router(
                second_producer.id(),
                PipeToRouterOptions::new(router_b.clone()),
            )
            .await
            .expect("Failed to pipe second producer");
        assert_eq!(
            second_pair.pipe_consumer.producer_id(),
            second_producer.id(),
        );
    });
}

fn audio_level_observer_volumes() {
    let (_worker_manager, _worker, router) = setup();

    future::block_on(async move {
        let transport = router
            .create_webrtc_transport(WebRtcTransportOptions::new(TransportListenIps::new(
                TransportListenIp {
                    ip: "127.0.0.1".parse().unwrap(),
                    announced_ip: None,
                },
            )))
            .await
            .expect("Failed to create WebRTC transport");

        let producer = transport
            .produce(audio_producer_options())
            .await
            .expect("Failed to produce");

        let observer = router
            .create_audio_level_observer(AudioLevelObserverOptions::default())
            .await
            .expect("Failed to create audio level observer");

        let (volume_sender, volume_receiver) = async_channel_pair();
        let _volumes_handler = observer.on_volumes(move |volumes| {
            for volume in volumes {
                let _ = volume_sender.try_send((volume.producer.id(), volume.volume));
            }
        });

        observer
            .add_producer(RtpObserverAddProducerOptions::new(producer.id()))
            .await
            .expect("Failed to add producer");

        // The fake worker reports a volume for the added producer.
        let (producer_id, volume) = volume_receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("No volumes received");
        assert_eq!(producer_id, producer.id());
        assert_eq!(volume, -50);
    });
}

fn consumer_closes_on_producer_close() {
    let (_worker_manager, _worker, router) = setup();

    future::block_on(async move {
        let transport = router
            .create_webrtc_transport(WebRtcTransportOptions::new(TransportListenIps::new(
                TransportListenIp {
                    ip: "127.0.0.1".parse().unwrap(),
                    announced_ip: None,
                },
            )))
            .await
            .expect("Failed to create WebRTC transport");

        let producer = transport
            .produce(audio_producer_options())
            .await
            .expect("Failed to produce");

        let consumer = transport
            .consume(ConsumerOptions::new(
                producer.id(),
                consuming_device_capabilities(),
            ))
            .await
            .expect("Failed to consume");

        let producer_close_events = Arc::new(AtomicUsize::new(0));
        let _producer_close_handler = consumer.on_producer_close({
            let producer_close_events = Arc::clone(&producer_close_events);
            move || {
                producer_close_events.fetch_add(1, Ordering::SeqCst);
            }
        });

        // Dropping the producer closes it on the worker, which notifies its consumers.
        drop(producer);

        wait_until("consumer to close after producer close", || {
            consumer.closed()
        });
        assert_eq!(producer_close_events.load(Ordering::SeqCst), 1);
    });
}

// Small blocking mpsc with timeout used to observe async events from test code.
fn async_channel_pair<T>() -> (SyncSender<T>, SyncReceiver<T>) {
    let (sender, receiver) = std::sync::mpsc::channel();
    (
        SyncSender {
            sender: std::sync::Mutex::new(sender),
        },
        SyncReceiver { receiver },
    )
}

struct SyncSender<T> {
    sender: std::sync::Mutex<std::sync::mpsc::Sender<T>>,
}

impl<T> SyncSender<T> {
    fn try_send(&self, value: T) -> Result<(), ()> {
        self.sender.lock().unwrap().send(value).map_err(drop)
    }
}

struct SyncReceiver<T> {
    receiver: std::sync::mpsc::Receiver<T>,
}

impl<T> SyncReceiver<T> {
    fn recv_timeout(&self, timeout: Duration) -> Result<T, ()> {
        self.receiver.recv_timeout(timeout).map_err(drop)
    }
}

/// The scripted worker stand-in: netstring framed JSON on the inherited fds.
mod fake_worker {
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::unix::io::FromRawFd;
    use std::sync::{Arc, Mutex};

    struct FrameReader {
        file: File,
        buffer: Vec<u8>,
    }

    impl FrameReader {
        fn new(file: File) -> Self {
            Self {
                file,
                buffer: Vec::new(),
            }
        }

        fn next_frame(&mut self) -> Option<Vec<u8>> {
            loop {
                if let Some(frame) = self.parse_frame() {
                    return Some(frame);
                }

                let mut chunk = [0u8; 4096];
                match self.file.read(&mut chunk) {
                    Ok(0) | Err(_) => return None,
                    Ok(read_bytes) => self.buffer.extend_from_slice(&chunk[..read_bytes]),
                }
            }
        }

        fn parse_frame(&mut self) -> Option<Vec<u8>> {
            let colon = self.buffer.iter().position(|&byte| byte == b':')?;
            let length = std::str::from_utf8(&self.buffer[..colon])
                .ok()?
                .parse::<usize>()
                .ok()?;
            let frame_end = colon + 1 + length + 1;
            if self.buffer.len() < frame_end {
                return None;
            }

            let body = self.buffer[colon + 1..frame_end - 1].to_vec();
            self.buffer.drain(..frame_end);
            Some(body)
        }
    }

    fn write_frame(file: &mut File, body: &[u8]) {
        let mut frame = Vec::with_capacity(body.len() + 16);
        frame.extend_from_slice(body.len().to_string().as_bytes());
        frame.push(b':');
        frame.extend_from_slice(body);
        frame.push(b',');
        let _ = file.write_all(&frame);
    }

    fn write_json(file: &mut File, value: &Value) {
        write_frame(file, value.to_string().as_bytes());
    }

    pub(super) fn run() {
        let requests_in = unsafe { File::from_raw_fd(3) };
        let mut responses_out = unsafe { File::from_raw_fd(4) };
        let payload_in = unsafe { File::from_raw_fd(5) };
        let payload_out = unsafe { File::from_raw_fd(6) };

        // Readiness handshake, keyed by our own pid.
        write_json(
            &mut responses_out,
            &json!({
                "targetId": std::process::id().to_string(),
                "event": "running",
            }),
        );

        // Last data consumer created, for looping direct messages back.
        let data_consumer_id = Arc::new(Mutex::new(None::<String>));

        {
            let data_consumer_id = Arc::clone(&data_consumer_id);
            std::thread::spawn(move || {
                payload_loop(payload_in, payload_out, data_consumer_id);
            });
        }

        let mut reader = FrameReader::new(requests_in);
        let mut state = State::default();

        while let Some(frame) = reader.next_frame() {
            let request = match serde_json::from_slice::<Value>(&frame) {
                Ok(request) => request,
                Err(_) => continue,
            };

            handle_request(&request, &mut responses_out, &mut state, &data_consumer_id);
        }
    }

    #[derive(Default)]
    struct State {
        next_port: u16,
        // producer id -> consumer ids consuming it.
        consumers_by_producer: HashMap<String, Vec<String>>,
    }

    fn handle_request(
        request: &Value,
        out: &mut File,
        state: &mut State,
        data_consumer_id: &Mutex<Option<String>>,
    ) {
        let id = &request["id"];
        let method = request["method"].as_str().unwrap_or("");
        let handler_id = request["handlerId"].as_str().unwrap_or("");
        let data = &request["data"];

        let accept = |data: Value| json!({ "id": id, "accepted": true, "data": data });

        match method {
            "worker.dump" => {
                let response = accept(json!({
                    "pid": std::process::id(),
                    "routerIds": [],
                }));
                write_json(out, &response);
            }
            "worker.getResourceUsage" => {
                let response = accept(json!({
                    "ru_utime": 0, "ru_stime": 0, "ru_maxrss": 0, "ru_ixrss": 0,
                    "ru_idrss": 0, "ru_isrss": 0, "ru_minflt": 0, "ru_majflt": 0,
                    "ru_nswap": 0, "ru_inblock": 0, "ru_oublock": 0, "ru_msgsnd": 0,
                    "ru_msgrcv": 0, "ru_nsignals": 0, "ru_nvcsw": 0, "ru_nivcsw": 0,
                }));
                write_json(out, &response);
            }
            "router.dump" => {
                let response = accept(json!({
                    "id": handler_id,
                    "transportIds": [],
                    "rtpObserverIds": [],
                }));
                write_json(out, &response);
            }
            "router.createWebRtcTransport" => {
                let mut transport_data = json!({
                    "iceRole": "controlled",
                    "iceParameters": {
                        "usernameFragment": "fragment",
                        "password": "password",
                        "iceLite": true,
                    },
                    "iceCandidates": [{
                        "foundation": "udpcandidate",
                        "priority": 1076302079_u32,
                        "ip": "127.0.0.1",
                        "protocol": "udp",
                        "port": 40000,
                        "type": "host",
                    }],
                    "iceState": "new",
                    "dtlsParameters": {
                        "role": "auto",
                        "fingerprints": [{
                            "algorithm": "sha-256",
                            "value": "82:5A:68:3D:36:C3:0A:DE:AF:E7:32:43:D2:88:83:57",
                        }],
                    },
                    "dtlsState": "new",
                });
                if data["enableSctp"].as_bool() == Some(true) {
                    transport_data["sctpParameters"] = json!({
                        "port": 5000,
                        "OS": data["numSctpStreams"]["OS"],
                        "MIS": data["numSctpStreams"]["MIS"],
                        "maxMessageSize": data["maxSctpMessageSize"],
                    });
                    transport_data["sctpState"] = json!("new");
                }
                write_json(out, &accept(transport_data));
            }
            "router.createPlainTransport" | "router.createPipeTransport" => {
                state.next_port += 1;
                let mut transport_data = json!({
                    "rtcpMux": data["rtcpMux"].as_bool().unwrap_or(true),
                    "comedia": data["comedia"].as_bool().unwrap_or(false),
                    "rtx": data["enableRtx"].as_bool().unwrap_or(false),
                    "tuple": {
                        "localIp": "127.0.0.1",
                        "localPort": 20000 + state.next_port,
                        "protocol": "udp",
                    },
                });
                if data["enableSctp"].as_bool() == Some(true) {
                    transport_data["sctpParameters"] = json!({
                        "port": 5000,
                        "OS": data["numSctpStreams"]["OS"],
                        "MIS": data["numSctpStreams"]["MIS"],
                        "maxMessageSize": data["maxSctpMessageSize"],
                    });
                    transport_data["sctpState"] = json!("new");
                }
                write_json(out, &accept(transport_data));
            }
            "router.createDirectTransport" => {
                write_json(out, &accept(json!({})));
            }
            "transport.connect" => {
                // Superset of every variant's response shape.
                write_json(
                    out,
                    &accept(json!({
                        "dtlsLocalRole": "client",
                        "tuple": {
                            "localIp": "127.0.0.1",
                            "localPort": 30000,
                            "protocol": "udp",
                        },
                    })),
                );
            }
            "transport.produce" => {
                write_json(out, &accept(json!({ "type": "simple" })));
            }
            "transport.consume" => {
                let consumer_id = data["consumerId"].as_str().unwrap_or("").to_string();
                let producer_id = data["producerId"].as_str().unwrap_or("").to_string();
                state
                    .consumers_by_producer
                    .entry(producer_id)
                    .or_default()
                    .push(consumer_id);

                write_json(
                    out,
                    &accept(json!({
                        "paused": data["paused"],
                        "producerPaused": false,
                        "score": {
                            "score": 10,
                            "producerScore": 10,
                            "producerScores": [10],
                        },
                        "preferredLayers": data["preferredLayers"],
                    })),
                );
            }
            "transport.produceData" => {
                write_json(out, &accept(Value::Null));
            }
            "transport.consumeData" => {
                data_consumer_id
                    .lock()
                    .unwrap()
                    .replace(data["dataConsumerId"].as_str().unwrap_or("").to_string());
                write_json(out, &accept(Value::Null));
            }
            "transport.closeProducer" => {
                write_json(out, &accept(Value::Null));

                // The worker closes all consumers of a closed producer and notifies them.
                let producer_id = data["producerId"].as_str().unwrap_or("");
                if let Some(consumer_ids) = state.consumers_by_producer.remove(producer_id) {
                    for consumer_id in consumer_ids {
                        write_json(
                            out,
                            &json!({
                                "targetId": consumer_id,
                                "event": "producerclose",
                            }),
                        );
                    }
                }
            }
            "rtpObserver.addProducer" => {
                write_json(out, &accept(Value::Null));

                // Immediately report a volume for the added producer.
                write_json(
                    out,
                    &json!({
                        "targetId": handler_id,
                        "event": "volumes",
                        "data": [{
                            "producerId": data["producerId"],
                            "volume": -50,
                        }],
                    }),
                );
            }
            "consumer.setPriority" => {
                write_json(out, &accept(json!({ "priority": data["priority"] })));
            }
            "consumer.setPreferredLayers" => {
                write_json(out, &accept(data.clone()));
            }
            "dataConsumer.getBufferedAmount" => {
                write_json(out, &accept(json!({ "bufferedAmount": 0 })));
            }
            _ => {
                // Every other method is a plain acknowledgement.
                write_json(out, &accept(Value::Null));
            }
        }
    }

    fn payload_loop(
        payload_in: File,
        mut payload_out: File,
        data_consumer_id: Arc<Mutex<Option<String>>>,
    ) {
        let mut reader = FrameReader::new(payload_in);

        loop {
            let meta = match reader.next_frame() {
                Some(meta) => meta,
                None => return,
            };
            let payload = match reader.next_frame() {
                Some(payload) => payload,
                None => return,
            };

            let meta = match serde_json::from_slice::<Value>(&meta) {
                Ok(meta) => meta,
                Err(_) => continue,
            };

            if meta["event"].as_str() == Some("dataProducer.send") {
                // Loop the message back to the data consumer, if one exists.
                if let Some(consumer_id) = data_consumer_id.lock().unwrap().clone() {
                    write_json(
                        &mut payload_out,
                        &json!({
                            "targetId": consumer_id,
                            "event": "message",
                            "data": { "ppid": meta["data"]["ppid"] },
                        }),
                    );
                    write_frame(&mut payload_out, &payload);
                }
            }
        }
    }
}
