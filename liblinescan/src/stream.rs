//! Reader task and the bounded pipe carrying its lines to the client.

use crate::{
    hardware::Hardware,
    packing::{LinePacker, VerticalInterpolator},
    reader::{ChannelLines, LineReader},
    result::{Result, SaneError},
    shading::Corrector,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        mpsc as std_mpsc, Arc,
    },
    thread,
    time::Duration,
};
use tokio::sync::mpsc::{self, error::TryRecvError};

/// Lines buffered between the reader task and the client.
const LINE_QUEUE: usize = 64;

/// Shared stop request, polled by the reader task once per line.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where reader tasks run.
#[derive(Debug, Clone, Default)]
pub enum Scheduler {
    /// A dedicated OS thread per scan.
    #[default]
    Thread,
    /// The blocking pool of a tokio runtime.
    Tokio(tokio::runtime::Handle),
}

impl Scheduler {
    /// Tokio's blocking pool when called inside a runtime, a thread otherwise.
    pub fn current() -> Self {
        tokio::runtime::Handle::try_current()
            .map(Scheduler::Tokio)
            .unwrap_or(Scheduler::Thread)
    }

    fn spawn<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            Scheduler::Thread => thread::Builder::new()
                .name("reader".into())
                .spawn(task)
                .map(|_| ())
                .map_err(|err| {
                    log::error!("Failed to spawn reader thread: {err}");
                    SaneError::NoMem
                }),
            Scheduler::Tokio(handle) => {
                drop(handle.spawn_blocking(task));
                Ok(())
            }
        }
    }
}

/// Everything the reader task owns for one scan.
pub struct Acquisition {
    pub hw: Hardware,
    pub reader: LineReader,
    pub corrector: Corrector,
    pub packer: LinePacker,
    pub vertical: Option<VerticalInterpolator>,
    pub work: ChannelLines,
    /// Lines to pull from the device.
    pub lines: u32,
}

struct TaskExit {
    status: Result<()>,
    hw: Hardware,
}

/// What a stopped scan leaves to the session.
pub enum Stopped {
    /// The reader task parked the device and returned its hardware.
    Parked(Hardware),
    /// The reader task outlived the cancel timeout and still owns the hardware.
    Detached(DetachedTask),
    /// The reader task ended without returning the hardware.
    Lost,
}

/// A reader task still parking the device after its session gave up waiting.
pub struct DetachedTask {
    exit: std_mpsc::Receiver<TaskExit>,
}

impl DetachedTask {
    /// The hardware once the task has exited, `DeviceBusy` while it still runs.
    /// `Ok(None)` means the task died without handing the hardware back.
    pub fn try_reclaim(&self) -> Result<Option<Hardware>> {
        match self.exit.try_recv() {
            Ok(TaskExit { hw, .. }) => Ok(Some(hw)),
            Err(std_mpsc::TryRecvError::Empty) => Err(SaneError::DeviceBusy),
            Err(std_mpsc::TryRecvError::Disconnected) => Ok(None),
        }
    }
}

fn send(lines: &mpsc::Sender<Vec<u8>>, bytes: &[u8]) -> Result<()> {
    // Fails only once the client side has closed.
    lines
        .blocking_send(bytes.to_vec())
        .map_err(|_| SaneError::Cancelled)
}

impl Acquisition {
    fn pump(
        &mut self,
        lines: &mpsc::Sender<Vec<u8>>,
        token: &CancellationToken,
        remaining: &AtomicU32,
    ) -> Result<()> {
        for _ in 0..self.lines {
            if token.is_cancelled() {
                return Err(SaneError::Cancelled);
            }

            let line = self.reader.read_line(&mut self.hw)?;
            self.work.copy_from(line);
            self.corrector.correct(&mut self.work);

            let packer = &mut self.packer;
            match self.vertical.as_mut() {
                Some(vertical) => vertical.push(&self.work, |line| send(lines, packer.pack(line)))?,
                None => send(lines, packer.pack(&self.work))?,
            }

            remaining.fetch_sub(1, Ordering::Relaxed);
        }

        if let Some(vertical) = self.vertical.as_mut() {
            let packer = &mut self.packer;
            vertical.finish(|line| send(lines, packer.pack(line)))?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    Finished,
}

/// Client end of a running scan.
pub struct ScanStream {
    lines: mpsc::Receiver<Vec<u8>>,
    exit: Option<std_mpsc::Receiver<TaskExit>>,
    token: CancellationToken,
    remaining: Arc<AtomicU32>,
    pending: Vec<u8>,
    position: usize,
    state: StreamState,
    hw: Option<Hardware>,
    cancel_timeout: Duration,
}

impl ScanStream {
    /// Hands `acquisition` to a reader task on `scheduler`. When no task can
    /// be started the acquisition comes back with the error.
    pub fn start(
        acquisition: Acquisition,
        scheduler: &Scheduler,
        cancel_timeout: Duration,
    ) -> ::core::result::Result<Self, (SaneError, Box<Acquisition>)> {
        let (line_tx, line_rx) = mpsc::channel(LINE_QUEUE);
        let (exit_tx, exit_rx) = std_mpsc::sync_channel(1);
        let (handoff_tx, handoff_rx) = std_mpsc::sync_channel::<Acquisition>(1);
        let token = CancellationToken::new();
        let remaining = Arc::new(AtomicU32::new(acquisition.lines));

        let task_token = token.clone();
        let task_remaining = remaining.clone();

        let spawned = scheduler.spawn(move || {
            let Ok(mut acquisition) = handoff_rx.recv() else {
                return;
            };
            log::debug!("Reader task started for {} lines", acquisition.lines);

            let status = acquisition.pump(&line_tx, &task_token, &task_remaining);
            drop(line_tx);

            match &status {
                Ok(()) => log::debug!("Reader task finished"),
                Err(err) if err.is_failure() => log::error!("Reader task failed: {err}"),
                Err(err) => log::debug!("Reader task stopped: {err}"),
            }

            acquisition.hw.park();

            // The receiver is gone when the session closed without reclaiming us.
            let _ = exit_tx.send(TaskExit {
                status,
                hw: acquisition.hw,
            });
        });

        if let Err(err) = spawned {
            return Err((err, Box::new(acquisition)));
        }
        // A scheduler that is shutting down drops the task unstarted.
        if let Err(std_mpsc::SendError(acquisition)) = handoff_tx.send(acquisition) {
            log::error!("Reader task dropped before it started");
            return Err((SaneError::IO, Box::new(acquisition)));
        }

        Ok(Self {
            lines: line_rx,
            exit: Some(exit_rx),
            token,
            remaining,
            pending: Vec::new(),
            position: 0,
            state: StreamState::Open,
            hw: None,
            cancel_timeout,
        })
    }

    /// Source lines the reader task has yet to deliver.
    pub fn lines_remaining(&self) -> u32 {
        self.remaining.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.state == StreamState::Finished
    }

    /// Copies the next bytes of the image into `buf`.
    ///
    /// Blocks for data unless `non_blocking`, in which case `Ok(0)` means
    /// nothing is ready yet. Must not be called from async context.
    pub fn read(&mut self, buf: &mut [u8], non_blocking: bool) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if self.position < self.pending.len() {
                let count = (self.pending.len() - self.position).min(buf.len());
                buf[..count].copy_from_slice(&self.pending[self.position..self.position + count]);
                self.position += count;
                return Ok(count);
            }

            if self.state == StreamState::Finished {
                return Err(SaneError::EOF);
            }

            let next = if non_blocking {
                match self.lines.try_recv() {
                    Ok(line) => Some(line),
                    Err(TryRecvError::Empty) => return Ok(0),
                    Err(TryRecvError::Disconnected) => None,
                }
            } else {
                self.lines.blocking_recv()
            };

            match next {
                Some(line) => {
                    self.pending = line;
                    self.position = 0;
                }
                None => {
                    self.state = StreamState::Finished;
                    self.collect_exit()?;
                    return Err(SaneError::EOF);
                }
            }
        }
    }

    /// Takes the reader task's exit status once the data pipe has closed.
    fn collect_exit(&mut self) -> Result<()> {
        let Some(exit) = self.exit.as_ref() else {
            return Ok(());
        };

        match exit.recv_timeout(self.cancel_timeout) {
            Ok(TaskExit { status, hw }) => {
                self.exit = None;
                self.hw = Some(hw);
                status
            }
            // Still parking, the session waits for it again on cancel.
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                log::warn!("Reader task still parking after {:?}", self.cancel_timeout);
                Ok(())
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                self.exit = None;
                log::error!("Reader task gone without status");
                Err(SaneError::IO)
            }
        }
    }

    /// Stops the reader task, waiting up to the cancel timeout for it to park
    /// the device.
    pub fn cancel(&mut self) -> Stopped {
        if self.state == StreamState::Open {
            log::debug!("Cancelling scan with {} lines left", self.lines_remaining());

            self.state = StreamState::Finished;
            self.token.cancel();
            self.lines.close();
            self.pending.clear();
            self.position = 0;
        }

        if let Some(hw) = self.hw.take() {
            return Stopped::Parked(hw);
        }
        let Some(exit) = self.exit.take() else {
            return Stopped::Lost;
        };

        match exit.recv_timeout(self.cancel_timeout) {
            Ok(TaskExit { status, hw }) => {
                if let Err(err) = status {
                    log::trace!("Reader task stopped with {err}");
                }
                Stopped::Parked(hw)
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                log::error!(
                    "Reader task did not stop within {:?}, detaching it",
                    self.cancel_timeout
                );
                Stopped::Detached(DetachedTask { exit })
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                log::error!("Reader task gone without returning the device");
                Stopped::Lost
            }
        }
    }

    /// Hardware returned by a reader task that ran to completion.
    pub fn take_hardware(&mut self) -> Option<Hardware> {
        self.hw.take()
    }
}

impl Drop for ScanStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
