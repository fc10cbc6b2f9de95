//! The control loop that owns the programming session
//!
//! HTTP handlers never touch the session. They send [`Command`]s over a
//! bounded channel to one thread that owns it, and read progress from a
//! `watch` channel the session publishes into. Every session mutation is
//! therefore serialized through a single owner, and status readers only
//! ever see whole snapshots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use stkbridge_core::link::PeerLink;
use stkbridge_core::progress::ProgressObserver;
use stkbridge_core::{Error, ProgrammingSession, ProgressSnapshot};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};

use super::error::ServerError;

/// Depth of the command queue
pub const COMMAND_QUEUE: usize = 16;

/// Loop period while a session is running
const ACTIVE_TICK: Duration = Duration::from_millis(1);
/// Loop period while idle
const IDLE_TICK: Duration = Duration::from_millis(10);

type Reply = oneshot::Sender<stkbridge_core::Result<()>>;

/// Requests to the control loop
pub enum Command {
    /// Start a session for an image of `total` bytes
    Begin { total: usize, reply: Reply },
    /// Upload bytes; the reply arrives once all of them were accepted
    Chunk { data: Vec<u8>, reply: Reply },
    /// The upload is complete
    End { reply: Reply },
    /// Run the reset sequence
    Reset { reply: Reply },
    /// Forward bytes to the peer's application
    Relay { data: Vec<u8>, reply: Reply },
}

/// Publishes snapshots into a `watch` channel
pub struct WatchObserver {
    sender: watch::Sender<ProgressSnapshot>,
}

impl WatchObserver {
    pub fn new(sender: watch::Sender<ProgressSnapshot>) -> Self {
        Self { sender }
    }
}

impl ProgressObserver for WatchObserver {
    fn on_update(&mut self, snapshot: &ProgressSnapshot) {
        self.sender.send_replace(snapshot.clone());
    }
}

struct PendingChunk {
    data: Vec<u8>,
    offset: usize,
    reply: Reply,
}

/// Single owner of the programming session
pub struct ControlLoop<L: PeerLink> {
    session: ProgrammingSession<L, WatchObserver>,
    commands: mpsc::Receiver<Command>,
    /// Set by [`ControlHandle::abort`], outside the bounded queue
    abort: Arc<AtomicBool>,
    pending: Option<PendingChunk>,
}

impl<L: PeerLink> ControlLoop<L> {
    pub fn new(
        session: ProgrammingSession<L, WatchObserver>,
        commands: mpsc::Receiver<Command>,
        abort: Arc<AtomicBool>,
    ) -> Self {
        Self {
            session,
            commands,
            abort,
            pending: None,
        }
    }

    /// Run until every [`ControlHandle`] is dropped
    pub fn run(mut self) {
        log::info!("control: Loop started");
        while let Some(pause) = self.step() {
            if !pause.is_zero() {
                thread::sleep(pause);
            }
        }

        self.session.abort();
        self.session.poll();
        log::info!("control: Loop stopped");
    }

    /// One iteration: the abort flag, at most one command, feeding and a
    /// session poll
    ///
    /// Returns how long to pause before the next iteration, or `None` once
    /// every handle is gone. No pause while upload bytes keep flowing.
    fn step(&mut self) -> Option<Duration> {
        // Ahead of the queue, so a later Begin never overtakes it
        if self.abort.swap(false, Ordering::AcqRel) {
            self.session.abort();
        }

        match self.commands.try_recv() {
            Ok(command) => self.handle(command),
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return None,
        }

        let fed = self.feed_pending();
        let state = self.session.poll();

        Some(if fed > 0 {
            Duration::ZERO
        } else if state.is_active() {
            ACTIVE_TICK
        } else {
            IDLE_TICK
        })
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Begin { total, reply } => {
                let _ = reply.send(self.session.start(total));
            }
            Command::Chunk { data, reply } => {
                if self.pending.is_some() {
                    let _ = reply.send(Err(Error::Busy));
                    return;
                }
                self.pending = Some(PendingChunk {
                    data,
                    offset: 0,
                    reply,
                });
            }
            Command::End { reply } => {
                let _ = reply.send(self.session.end_upload());
            }
            Command::Reset { reply } => {
                let _ = reply.send(self.session.reset());
            }
            Command::Relay { data, reply } => {
                let _ = reply.send(self.session.relay(&data));
            }
        }
    }

    /// Offer the pending chunk to the session, returning the bytes taken
    fn feed_pending(&mut self) -> usize {
        let Some(mut chunk) = self.pending.take() else {
            return 0;
        };

        match self.session.feed(&chunk.data[chunk.offset..]) {
            Ok(taken) => {
                chunk.offset += taken;
                if chunk.offset == chunk.data.len() {
                    let _ = chunk.reply.send(Ok(()));
                } else {
                    self.pending = Some(chunk);
                }
                taken
            }
            Err(e) => {
                let _ = chunk.reply.send(Err(e));
                0
            }
        }
    }
}

/// Cloneable handle used by the HTTP handlers
#[derive(Clone)]
pub struct ControlHandle {
    commands: mpsc::Sender<Command>,
    abort: Arc<AtomicBool>,
    progress: watch::Receiver<ProgressSnapshot>,
}

impl ControlHandle {
    pub fn new(
        commands: mpsc::Sender<Command>,
        abort: Arc<AtomicBool>,
        progress: watch::Receiver<ProgressSnapshot>,
    ) -> Self {
        Self {
            commands,
            abort,
            progress,
        }
    }

    async fn call(&self, command: impl FnOnce(Reply) -> Command) -> Result<(), ServerError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| ServerError::ControlLoopGone)?;
        let result = response.await.map_err(|_| ServerError::ControlLoopGone)?;
        Ok(result?)
    }

    pub async fn begin(&self, total: usize) -> Result<(), ServerError> {
        self.call(|reply| Command::Begin { total, reply }).await
    }

    pub async fn chunk(&self, data: Vec<u8>) -> Result<(), ServerError> {
        self.call(|reply| Command::Chunk { data, reply }).await
    }

    pub async fn end(&self) -> Result<(), ServerError> {
        self.call(|reply| Command::End { reply }).await
    }

    pub async fn reset(&self) -> Result<(), ServerError> {
        self.call(|reply| Command::Reset { reply }).await
    }

    pub async fn relay(&self, data: Vec<u8>) -> Result<(), ServerError> {
        self.call(|reply| Command::Relay { data, reply }).await
    }

    /// Request an abort without waiting; usable from `Drop`
    ///
    /// Never lost to a full command queue: the loop checks the flag on
    /// every iteration.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    /// Latest snapshot
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.progress.borrow().clone()
    }

    /// Wait until the session reaches `COMPLETE` or `ERROR`
    pub async fn wait_terminal(&self) -> ProgressSnapshot {
        let mut progress = self.progress.clone();
        if let Ok(snapshot) = progress.wait_for(|p| p.state.is_terminal()).await {
            return snapshot.clone();
        }
        let snapshot = progress.borrow().clone();
        snapshot
    }
}

/// Aborts the session unless disarmed, for uploads cut short by a
/// disconnecting client
pub struct AbortOnDrop {
    control: ControlHandle,
    armed: bool,
}

impl AbortOnDrop {
    pub fn new(control: ControlHandle) -> Self {
        Self {
            control,
            armed: true,
        }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if self.armed {
            log::warn!("Upload interrupted, aborting session");
            self.control.abort();
        }
    }
}
