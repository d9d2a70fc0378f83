//! A worker represents a media worker subprocess that runs the data-plane (ICE/DTLS/SRTP, RTP
//! forwarding, SCTP) and handles [`Router`] instances on behalf of this process.

mod channel;
mod common;
mod netstring;
mod payload_channel;
mod utils;

use crate::data_structures::AppData;
use crate::messages::{
    WorkerCreateRouterRequest, WorkerDumpRequest, WorkerGetResourceUsageRequest,
    WorkerUpdateSettingsRequest,
};
use crate::ortc;
pub use crate::ortc::RtpCapabilitiesError;
use crate::router::{Router, RouterId, RouterOptions};
use crate::worker::utils::SpawnResult;
use crate::worker_manager::WorkerManager;
use async_executor::Executor;
use async_process::{Child, Command, Stdio};
pub(crate) use channel::{Channel, InternalMessage};
pub use channel::{NotificationError, RequestError};
pub(crate) use common::SubscriptionHandler;
use event_listener_primitives::{Bag, BagOnce, HandlerId};
use futures_lite::io::BufReader;
use futures_lite::{AsyncBufReadExt, FutureExt, StreamExt};
use log::*;
use parking_lot::Mutex;
pub(crate) use payload_channel::{NotificationMessage, PayloadChannel};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::io;
use thiserror::Error;
pub use utils::ExitError;

/// Logging level for logs generated by the media worker subprocess.
///
/// Default [`WorkerLogLevel::Error`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerLogLevel {
    /// Log all severities.
    Debug,
    /// Log "warn" and "error" severities.
    Warn,
    /// Log "error" severity only.
    Error,
    /// Do not log anything.
    None,
}

impl Default for WorkerLogLevel {
    fn default() -> Self {
        Self::Error
    }
}

impl WorkerLogLevel {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::None => "none",
        }
    }
}

/// Log tags for debugging, chosen by the subsystem of the worker they originate from.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerLogTag {
    /// Logs about software/library versions, configuration and process information.
    Info,
    /// Logs about ICE.
    Ice,
    /// Logs about DTLS.
    Dtls,
    /// Logs about RTP.
    Rtp,
    /// Logs about SRTP encryption/decryption.
    Srtp,
    /// Logs about RTCP.
    Rtcp,
    /// Logs about RTP retransmission, including NACK/PLI/FIR.
    Rtx,
    /// Logs about transport bandwidth estimation.
    Bwe,
    /// Logs related to the scores of producers and consumers.
    Score,
    /// Logs about video simulcast.
    Simulcast,
    /// Logs about video SVC.
    Svc,
    /// Logs about SCTP (DataChannel).
    Sctp,
    /// Logs about messages (SCTP messages or direct messages).
    Message,
}

impl WorkerLogTag {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Ice => "ice",
            Self::Dtls => "dtls",
            Self::Rtp => "rtp",
            Self::Srtp => "srtp",
            Self::Rtcp => "rtcp",
            Self::Rtx => "rtx",
            Self::Bwe => "bwe",
            Self::Score => "score",
            Self::Simulcast => "simulcast",
            Self::Svc => "svc",
            Self::Sctp => "sctp",
            Self::Message => "message",
        }
    }
}

/// Settings for a worker to be created with.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct WorkerSettings {
    /// Custom application data.
    pub app_data: AppData,
    /// Logging level for logs generated by the media worker subprocess.
    /// Default `WorkerLogLevel::Error`.
    pub log_level: WorkerLogLevel,
    /// Log tags for debugging.
    pub log_tags: Vec<WorkerLogTag>,
    /// Minimum RTC port for ICE, DTLS, RTP, etc. Default 10000.
    pub rtc_min_port: u16,
    /// Maximum RTC port for ICE, DTLS, RTP, etc. Default 59999.
    pub rtc_max_port: u16,
    /// Path to the DTLS public certificate file in PEM format. If unset, a certificate is
    /// dynamically created.
    pub dtls_certificate_file: Option<PathBuf>,
    /// Path to the DTLS certificate private key file in PEM format. If unset, a certificate is
    /// dynamically created.
    pub dtls_private_key_file: Option<PathBuf>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            app_data: AppData::default(),
            log_level: WorkerLogLevel::default(),
            log_tags: Vec::new(),
            rtc_min_port: 10000,
            rtc_max_port: 59999,
            dtls_certificate_file: None,
            dtls_private_key_file: None,
        }
    }
}

/// Worker settings that can be updated in runtime.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct WorkerUpdateSettings {
    /// If `None`, logging level will not be updated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<WorkerLogLevel>,
    /// If `None`, log tags will not be updated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_tags: Option<Vec<WorkerLogTag>>,
}

/// Worker subprocess resource usage, as reported by `getrusage(2)`.
#[derive(Debug, Copy, Clone, Deserialize)]
#[non_exhaustive]
pub struct WorkerResourceUsage {
    /// User CPU time used (in ms).
    pub ru_utime: u64,
    /// System CPU time used (in ms).
    pub ru_stime: u64,
    /// Maximum resident set size.
    pub ru_maxrss: u64,
    /// Integral shared memory size.
    pub ru_ixrss: u64,
    /// Integral unshared data size.
    pub ru_idrss: u64,
    /// Integral unshared stack size.
    pub ru_isrss: u64,
    /// Page reclaims (soft page faults).
    pub ru_minflt: u64,
    /// Page faults (hard page faults).
    pub ru_majflt: u64,
    /// Swaps.
    pub ru_nswap: u64,
    /// Block input operations.
    pub ru_inblock: u64,
    /// Block output operations.
    pub ru_oublock: u64,
    /// IPC messages sent.
    pub ru_msgsnd: u64,
    /// IPC messages received.
    pub ru_msgrcv: u64,
    /// Signals received.
    pub ru_nsignals: u64,
    /// Voluntary context switches.
    pub ru_nvcsw: u64,
    /// Involuntary context switches.
    pub ru_nivcsw: u64,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[doc(hidden)]
pub struct WorkerDump {
    pub pid: u32,
    pub router_ids: Vec<RouterId>,
}

/// Error that caused [`Worker::create_router`] to fail.
#[derive(Debug, Error)]
pub enum CreateRouterError {
    /// The worker is already closed.
    #[error("Worker is closed")]
    WorkerClosed,
    /// RTP capabilities generation error.
    #[error("RTP capabilities generation error: {0}")]
    FailedRtpCapabilitiesGeneration(RtpCapabilitiesError),
    /// Request to worker failed.
    #[error("Request to worker failed: {0}")]
    Request(RequestError),
}

#[derive(Default)]
struct Handlers {
    new_router: Bag<Box<dyn Fn(&Router) + Send + Sync>>,
    dead: BagOnce<Box<dyn FnOnce(ExitError) + Send>>,
    close: BagOnce<Box<dyn FnOnce() + Send>>,
}

struct Inner {
    channel: Channel,
    payload_channel: PayloadChannel,
    child: Mutex<Child>,
    executor: Arc<Executor<'static>>,
    pid: u32,
    handlers: Handlers,
    app_data: AppData,
    closed: Arc<AtomicBool>,
    // Worker manager must outlive every worker it created (it owns the executor thread).
    worker_manager: WorkerManager,
}

impl Drop for Inner {
    fn drop(&mut self) {
        debug!("drop()");

        self.close();
    }
}

impl Inner {
    async fn new(
        executor: Arc<Executor<'static>>,
        worker_binary: PathBuf,
        WorkerSettings {
            app_data,
            log_level,
            log_tags,
            rtc_min_port,
            rtc_max_port,
            dtls_certificate_file,
            dtls_private_key_file,
        }: WorkerSettings,
        worker_manager: WorkerManager,
    ) -> io::Result<Arc<Self>> {
        debug!("new()");

        let mut spawn_args: Vec<OsString> = Vec::new();

        spawn_args.push(format!("--logLevel={}", log_level.as_str()).into());
        if !log_tags.is_empty() {
            let log_tags = log_tags
                .iter()
                .map(|log_tag| log_tag.as_str())
                .collect::<Vec<_>>()
                .join(",");
            spawn_args.push(format!("--logTags={}", log_tags).into());
        }
        spawn_args.push(format!("--rtcMinPort={}", rtc_min_port).into());
        spawn_args.push(format!("--rtcMaxPort={}", rtc_max_port).into());

        if let Some(dtls_certificate_file) = dtls_certificate_file {
            let mut arg = OsString::new();
            arg.push("--dtlsCertificateFile=");
            arg.push(dtls_certificate_file);
            spawn_args.push(arg);
        }
        if let Some(dtls_private_key_file) = dtls_private_key_file {
            let mut arg = OsString::new();
            arg.push("--dtlsPrivateKeyFile=");
            arg.push(dtls_private_key_file);
            spawn_args.push(arg);
        }

        debug!(
            "spawning worker process: {} {}",
            worker_binary.to_string_lossy(),
            spawn_args
                .iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" "),
        );

        let mut command = Command::new(worker_binary);
        command
            .args(spawn_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("SWITCHBOARD_VERSION", env!("CARGO_PKG_VERSION"));

        let SpawnResult {
            mut child,
            channel,
            payload_channel,
            buffer_messages_guard,
        } = utils::spawn_with_worker_channels(Arc::clone(&executor), &mut command)?;

        let pid = child.id();

        setup_output_forwarding(&executor, &mut child, pid);

        let status_fut = child.status();

        let inner = Self {
            channel,
            payload_channel,
            child: Mutex::new(child),
            executor,
            pid,
            handlers: Handlers::default(),
            app_data,
            closed: Arc::new(AtomicBool::new(false)),
            worker_manager,
        };

        inner.wait_for_worker_process(buffer_messages_guard).await?;

        inner.setup_message_handling();

        let inner = Arc::new(inner);
        {
            let inner_weak = Arc::downgrade(&inner);
            inner
                .executor
                .spawn(async move {
                    let status = status_fut.await;

                    if let Some(inner) = inner_weak.upgrade() {
                        if !inner.closed.load(Ordering::SeqCst) {
                            let exit_error = match status {
                                Ok(status) => {
                                    warn!(
                                        "worker process died unexpectedly [pid:{}, status:{}]",
                                        inner.pid, status,
                                    );

                                    utils::exit_result_from_status(status)
                                        .err()
                                        .unwrap_or(ExitError::Unexpected)
                                }
                                Err(error) => {
                                    warn!(
                                        "failed to retrieve worker process status [pid:{}]: {}",
                                        inner.pid, error,
                                    );

                                    ExitError::Unexpected
                                }
                            };

                            inner.handlers.dead.call(|callback| {
                                callback(exit_error);
                            });
                            inner.close();
                        }
                    }
                })
                .detach();
        }

        Ok(inner)
    }

    /// Await the `running` readiness notification on the pid target, racing it against an early
    /// process exit.
    async fn wait_for_worker_process(
        &self,
        buffer_messages_guard: channel::BufferMessagesGuard,
    ) -> io::Result<()> {
        let status_fut = self.child.lock().status();

        self.wait_for_worker_ready(buffer_messages_guard)
            .or(async move {
                let status = status_fut.await?;

                let error_message = match utils::exit_result_from_status(status) {
                    Err(ExitError::Settings) => {
                        "worker process exited before being ready: wrong settings".to_string()
                    }
                    result => format!(
                        "worker process exited before being ready: {:?}",
                        result,
                    ),
                };

                Err(io::Error::new(io::ErrorKind::NotFound, error_message))
            })
            .await
    }

    async fn wait_for_worker_ready(
        &self,
        buffer_messages_guard: channel::BufferMessagesGuard,
    ) -> io::Result<()> {
        #[derive(Deserialize)]
        #[serde(tag = "event", rename_all = "lowercase")]
        enum Notification {
            Running,
        }

        let (sender, receiver) = async_oneshot::oneshot();
        let pid = self.pid;
        let sender = Mutex::new(Some(sender));
        let _handler =
            self.channel
                .subscribe_to_notifications(self.pid.to_string(), move |notification| {
                    let result = match serde_json::from_value(notification.clone()) {
                        Ok(Notification::Running) => {
                            debug!("worker process running [pid:{}]", pid);
                            Ok(())
                        }
                        Err(error) => Err(io::Error::new(
                            io::ErrorKind::Other,
                            format!(
                                "unexpected first notification from worker [pid:{}]: {}; error: {}",
                                pid, notification, error,
                            ),
                        )),
                    };

                    if let Some(sender) = sender.lock().take() {
                        let _ = sender.send(result);
                    }
                });

        // Let buffered worker notifications through now that the subscription exists.
        drop(buffer_messages_guard);

        receiver.await.map_err(|_closed| {
            io::Error::new(io::ErrorKind::Other, "worker dropped before it is ready")
        })?
    }

    fn setup_message_handling(&self) {
        let channel_receiver = self.channel.get_internal_message_receiver();
        let pid = self.pid;
        let closed = Arc::clone(&self.closed);
        self.executor
            .spawn(async move {
                while let Ok(message) = channel_receiver.recv().await {
                    match message {
                        InternalMessage::Debug(text) => debug!("[pid:{}] {}", pid, text),
                        InternalMessage::Warn(text) => warn!("[pid:{}] {}", pid, text),
                        InternalMessage::Error(text) => {
                            if !closed.load(Ordering::SeqCst) {
                                error!("[pid:{}] {}", pid, text);
                            }
                        }
                        InternalMessage::Dump(text) => debug!("[pid:{}] {}", pid, text),
                        InternalMessage::Unexpected(data) => error!(
                            "worker[pid:{}] unexpected channel data: {}",
                            pid,
                            String::from_utf8_lossy(&data),
                        ),
                    }
                }
            })
            .detach();
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("close()");

            if matches!(self.child.lock().try_status(), Ok(None)) {
                unsafe {
                    libc::kill(self.pid as libc::pid_t, libc::SIGTERM);
                }
            }

            self.channel.close();
            self.payload_channel.close();

            self.handlers.close.call_simple();
        }
    }
}

/// A worker represents a media worker subprocess that runs the data-plane and handles
/// [`Router`] instances.
#[derive(Clone)]
#[must_use = "Worker will be destroyed on drop, make sure to keep it around for as long as needed"]
pub struct Worker {
    inner: Arc<Inner>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("pid", &self.inner.pid)
            .field("closed", &self.inner.closed)
            .finish()
    }
}

impl Worker {
    pub(crate) async fn new(
        executor: Arc<Executor<'static>>,
        worker_binary: PathBuf,
        worker_settings: WorkerSettings,
        worker_manager: WorkerManager,
    ) -> io::Result<Self> {
        let inner = Inner::new(executor, worker_binary, worker_settings, worker_manager).await?;

        Ok(Self { inner })
    }

    /// Worker process identifier (PID).
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// Worker manager this worker belongs to.
    pub fn worker_manager(&self) -> &WorkerManager {
        &self.inner.worker_manager
    }

    /// Custom application data.
    pub fn app_data(&self) -> &AppData {
        &self.inner.app_data
    }

    /// Whether the worker is closed.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Dump internal stat of the worker.
    #[doc(hidden)]
    pub async fn dump(&self) -> Result<WorkerDump, RequestError> {
        debug!("dump()");

        self.inner.channel.request("", WorkerDumpRequest {}).await
    }

    /// Worker process resource usage.
    pub async fn get_resource_usage(&self) -> Result<WorkerResourceUsage, RequestError> {
        debug!("get_resource_usage()");

        self.inner
            .channel
            .request("", WorkerGetResourceUsageRequest {})
            .await
    }

    /// Update settings of an already running worker. Just a subset of the worker settings can
    /// be updated.
    pub async fn update_settings(&self, data: WorkerUpdateSettings) -> Result<(), RequestError> {
        debug!("update_settings()");

        self.inner
            .channel
            .request("", WorkerUpdateSettingsRequest { data })
            .await
    }

    /// Create a router.
    ///
    /// Worker will be kept alive as long as at least one router instance is alive.
    pub async fn create_router(
        &self,
        router_options: RouterOptions,
    ) -> Result<Router, CreateRouterError> {
        debug!("create_router()");

        if self.closed() {
            return Err(CreateRouterError::WorkerClosed);
        }

        let RouterOptions {
            app_data,
            media_codecs,
        } = router_options;

        let rtp_capabilities = ortc::generate_router_rtp_capabilities(media_codecs)
            .map_err(CreateRouterError::FailedRtpCapabilitiesGeneration)?;

        let router_id = RouterId::new();

        self.inner
            .channel
            .request("", WorkerCreateRouterRequest { router_id })
            .await
            .map_err(CreateRouterError::Request)?;

        let router = Router::new(
            router_id,
            Arc::clone(&self.inner.executor),
            self.inner.channel.clone(),
            self.inner.payload_channel.clone(),
            rtp_capabilities,
            app_data,
            self.clone(),
        );

        self.inner.handlers.new_router.call(|callback| {
            callback(&router);
        });

        Ok(router)
    }

    /// Callback is called when a new router is created.
    pub fn on_new_router<F: Fn(&Router) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.new_router.add(Box::new(callback))
    }

    /// Callback is called when the worker process dies unexpectedly; at most once, and always
    /// before the close callback.
    pub fn on_dead<F: FnOnce(ExitError) + Send + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.dead.add(Box::new(callback))
    }

    /// Callback is called when the worker is closed for whatever reason.
    ///
    /// NOTE: Callback will be called in place if the worker is already closed.
    pub fn on_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        let handler_id = self.inner.handlers.close.add(Box::new(callback));
        if self.inner.closed.load(Ordering::Relaxed) {
            self.inner.handlers.close.call_simple();
        }
        handler_id
    }

    /// Close the worker: terminate the subprocess, close both channels and cascade the close to
    /// every router created on it. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

fn setup_output_forwarding(executor: &Arc<Executor<'static>>, child: &mut Child, pid: u32) {
    if let Some(stdout) = child.stdout.take() {
        executor
            .spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Some(Ok(line)) = lines.next().await {
                    debug!("(stdout) [pid:{}] {}", pid, line);
                }
            })
            .detach();
    }

    if let Some(stderr) = child.stderr.take() {
        executor
            .spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Some(Ok(line)) = lines.next().await {
                    error!("(stderr) [pid:{}] {}", pid, line);
                }
            })
            .detach();
    }
}
