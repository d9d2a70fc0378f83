//! Worker subprocess spawning with the inherited pipe file descriptor contract.
//!
//! The worker expects: fd 0 closed (null), 1/2 = stdout/stderr, 3 = channel ingress,
//! 4 = channel egress, 5 = payload channel ingress, 6 = payload channel egress ("ingress" and
//! "egress" from the worker's point of view).

use crate::worker::channel::BufferMessagesGuard;
use crate::worker::{Channel, PayloadChannel};
use async_executor::Executor;
use async_fs::File as AsyncFile;
use async_process::unix::CommandExt;
use async_process::{Child, Command, ExitStatus};
use nix::unistd;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::fs::File as StdFile;
use std::io;
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::Arc;
use thiserror::Error;

/// Error describing why the worker subprocess exited.
#[derive(Debug, Copy, Clone, Error)]
pub enum ExitError {
    /// Generic error.
    #[error("Worker process exited with generic error")]
    Generic,
    /// Wrong settings given on the command line.
    #[error("Worker process exited due to wrong settings")]
    Settings,
    /// Unknown error.
    #[error("Worker process exited with unknown error and status code {status_code}")]
    Unknown {
        /// Exit status code of the process.
        status_code: i32,
    },
    /// Unexpected error (killed by a signal).
    #[error("Worker process exited unexpectedly")]
    Unexpected,
}

pub(super) fn exit_result_from_status(status: ExitStatus) -> Result<(), ExitError> {
    if status.success() {
        return Ok(());
    }

    match status.code() {
        Some(1) => Err(ExitError::Generic),
        Some(42) => Err(ExitError::Settings),
        Some(status_code) => Err(ExitError::Unknown { status_code }),
        None => Err(ExitError::Unexpected),
    }
}

// Spawning from multiple threads concurrently races on the inherited pipe fds, so it is
// serialized process-wide.
static SPAWNING: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub(super) struct SpawnResult {
    pub(super) child: Child,
    pub(super) channel: Channel,
    pub(super) payload_channel: PayloadChannel,
    /// Held until the readiness subscription exists; queues early worker notifications.
    pub(super) buffer_messages_guard: BufferMessagesGuard,
}

fn create_pipe() -> io::Result<(RawFd, RawFd)> {
    unistd::pipe().map_err(|error| io::Error::new(io::ErrorKind::Other, error))
}

pub(super) fn spawn_with_worker_channels(
    executor: Arc<Executor<'static>>,
    command: &mut Command,
) -> io::Result<SpawnResult> {
    let _lock = SPAWNING.lock();

    let (producer_fd_read, producer_fd_write) = create_pipe()?;
    let (consumer_fd_read, consumer_fd_write) = create_pipe()?;
    let (producer_payload_fd_read, producer_payload_fd_write) = create_pipe()?;
    let (consumer_payload_fd_read, consumer_payload_fd_write) = create_pipe()?;

    unsafe {
        command.pre_exec(move || {
            // Parent-side ends are useless in the child.
            unistd::close(producer_fd_write).expect("Failed to close fd");
            unistd::close(consumer_fd_read).expect("Failed to close fd");
            unistd::close(producer_payload_fd_write).expect("Failed to close fd");
            unistd::close(consumer_payload_fd_read).expect("Failed to close fd");

            // Duplicate the child-side ends onto the fd numbers of the protocol contract.
            if producer_fd_read != 3 {
                unistd::dup2(producer_fd_read, 3).expect("Failed to duplicate fd");
                unistd::close(producer_fd_read).expect("Failed to close fd");
            }
            if consumer_fd_write != 4 {
                unistd::dup2(consumer_fd_write, 4).expect("Failed to duplicate fd");
                unistd::close(consumer_fd_write).expect("Failed to close fd");
            }
            if producer_payload_fd_read != 5 {
                unistd::dup2(producer_payload_fd_read, 5).expect("Failed to duplicate fd");
                unistd::close(producer_payload_fd_read).expect("Failed to close fd");
            }
            if consumer_payload_fd_write != 6 {
                unistd::dup2(consumer_payload_fd_write, 6).expect("Failed to duplicate fd");
                unistd::close(consumer_payload_fd_write).expect("Failed to close fd");
            }

            Ok(())
        });
    }

    let producer_file: AsyncFile = unsafe { StdFile::from_raw_fd(producer_fd_write) }.into();
    let consumer_file: AsyncFile = unsafe { StdFile::from_raw_fd(consumer_fd_read) }.into();
    let producer_payload_file: AsyncFile =
        unsafe { StdFile::from_raw_fd(producer_payload_fd_write) }.into();
    let consumer_payload_file: AsyncFile =
        unsafe { StdFile::from_raw_fd(consumer_payload_fd_read) }.into();

    let channel = Channel::new(Arc::clone(&executor), consumer_file, producer_file);
    let payload_channel = PayloadChannel::new(
        executor,
        consumer_payload_file,
        producer_payload_file,
    );

    // Buffering must be active before the worker exists, otherwise its first notifications
    // could race the readiness subscription.
    let buffer_messages_guard = channel.buffer_messages();

    let child = command.spawn()?;

    // Child-side ends are useless in the parent.
    let _ = unistd::close(producer_fd_read);
    let _ = unistd::close(consumer_fd_write);
    let _ = unistd::close(producer_payload_fd_read);
    let _ = unistd::close(consumer_payload_fd_write);

    Ok(SpawnResult {
        child,
        channel,
        payload_channel,
        buffer_messages_guard,
    })
}

/// Two unidirectional pipes wrapped as one async end and one blocking end each, for driving
/// channels without a subprocess.
#[cfg(test)]
pub(crate) fn duplex_pipe_pair() -> ((AsyncFile, StdFile), (StdFile, AsyncFile)) {
    let (a_read, a_write) = create_pipe().unwrap();
    let (b_read, b_write) = create_pipe().unwrap();

    let async_reader: AsyncFile = unsafe { StdFile::from_raw_fd(a_read) }.into();
    let std_writer = unsafe { StdFile::from_raw_fd(a_write) };
    let std_reader = unsafe { StdFile::from_raw_fd(b_read) };
    let async_writer: AsyncFile = unsafe { StdFile::from_raw_fd(b_write) }.into();

    ((async_reader, std_writer), (std_reader, async_writer))
}
