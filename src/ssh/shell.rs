// 交互式 Shell 通道：独立线程读取输出，按接收顺序投递给消费者
use crate::ssh::client::{retry_io, settle, Backoff, SshClient, RELEASE_TIMEOUT};
use crate::utils::error::{Result, SessionError};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use futures::Stream;
use log::{debug, info, warn};
use ssh2::Channel;
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::thread;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const READ_BUFFER_SIZE: usize = 16 * 1024;
/// Chunks buffered ahead of a slow consumer before the reader waits.
const OUTPUT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    Idle,
    Opening,
    Streaming,
    Closed,
}

enum ShellCommand {
    Input(Vec<u8>, oneshot::Sender<Result<()>>),
}

/// Cloneable write half of an open shell.
#[derive(Clone)]
pub struct ShellInput {
    commands: Sender<ShellCommand>,
}

impl ShellInput {
    /// Writes `line` plus a newline and flushes. Resolves once the bytes are
    /// on the channel, or with the write error.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(ShellCommand::Input(bytes, reply_tx))
            .map_err(|_| SessionError::channel("shell is closed"))?;
        reply_rx
            .await
            .map_err(|_| SessionError::channel("shell closed before the write completed"))?
    }
}

/// Output half of a shell: an ordered stream of text chunks, one per read.
///
/// Ends with `None` on remote EOF, explicit close or disconnect; yields one
/// `Err` first if the read side failed.
pub struct ShellOutput {
    chunks: mpsc::Receiver<Result<String>>,
}

impl ShellOutput {
    pub async fn next_chunk(&mut self) -> Option<Result<String>> {
        self.chunks.recv().await
    }
}

impl Stream for ShellOutput {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.chunks.poll_recv(cx)
    }
}

/// Handle the façade keeps for the lifetime of a shell.
pub struct ShellChannel {
    input: ShellInput,
    state: Arc<Mutex<ShellState>>,
    token: CancellationToken,
    finished: oneshot::Receiver<()>,
}

impl ShellChannel {
    /// Negotiates the channel and starts the pump thread. Blocking; run it
    /// on the worker pool.
    pub fn open(client: Arc<SshClient>, token: CancellationToken) -> Result<(ShellChannel, ShellOutput)> {
        let state = Arc::new(Mutex::new(ShellState::Idle));
        set_state(&state, ShellState::Opening);

        let channel = match client.open_shell(&token) {
            Ok(channel) => channel,
            Err(e) => {
                set_state(&state, ShellState::Closed);
                return Err(e);
            }
        };

        let (command_tx, command_rx) = unbounded();
        let (chunk_tx, chunk_rx) = mpsc::channel(OUTPUT_CAPACITY);
        let (finished_tx, finished_rx) = oneshot::channel();

        set_state(&state, ShellState::Streaming);
        let pump = Pump {
            channel,
            commands: command_rx,
            output: chunk_tx,
            token: token.clone(),
            state: Arc::clone(&state),
            _finished: finished_tx,
            _client: client,
        };

        let spawned = thread::Builder::new()
            .name("ssh-shell".to_string())
            .spawn(move || pump.run());
        if let Err(e) = spawned {
            // 闭包连同 pump 已被丢弃，通道随之释放
            set_state(&state, ShellState::Closed);
            return Err(SessionError::channel(format!("failed to start shell reader: {}", e)));
        }

        info!("Shell opened");
        Ok((
            ShellChannel {
                input: ShellInput { commands: command_tx },
                state,
                token,
                finished: finished_rx,
            },
            ShellOutput { chunks: chunk_rx },
        ))
    }

    pub fn input(&self) -> ShellInput {
        self.input.clone()
    }

    pub fn state(&self) -> ShellState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ShellState::Closed
    }

    /// Stops the pump and waits until the channel has been released.
    pub async fn close(self) {
        self.token.cancel();
        // 发送端在读取线程结束时被丢弃
        let _ = self.finished.await;
        debug!("Shell closed");
    }
}

fn set_state(state: &Mutex<ShellState>, next: ShellState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

struct Pump {
    channel: Channel,
    commands: Receiver<ShellCommand>,
    output: mpsc::Sender<Result<String>>,
    token: CancellationToken,
    state: Arc<Mutex<ShellState>>,
    _finished: oneshot::Sender<()>,
    // 保证读取期间传输会话对象存活；断开由令牌通知
    _client: Arc<SshClient>,
}

impl Pump {
    fn run(mut self) {
        match self.stream() {
            Ok(()) => debug!("Shell stream ended"),
            Err(e) => {
                warn!("Shell stream failed: {}", e);
                self.emit(Err(e));
            }
        }

        set_state(&self.state, ShellState::Closed);
        self.close_channel();
    }

    fn stream(&mut self) -> Result<()> {
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        let mut decoder = Utf8Decoder::default();
        let mut backoff = Backoff::new();

        let result = loop {
            if self.token.is_cancelled() {
                break Ok(());
            }

            let mut busy = match drain_commands(&mut self.channel, &self.commands, &self.token) {
                Ok(busy) => busy,
                Err(()) => break Ok(()),
            };

            match self.channel.read(&mut buffer) {
                Ok(0) => {
                    if self.channel.eof() {
                        break Ok(());
                    }
                }
                Ok(n) => {
                    busy = true;
                    let text = decoder.decode(&buffer[..n]);
                    if !text.is_empty() && !self.emit(Ok(text)) {
                        debug!("Shell output consumer went away");
                        break Ok(());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.channel.eof() {
                        break Ok(());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    // 断开期间的读错误属于正常结束
                    if self.token.is_cancelled() {
                        break Ok(());
                    }
                    break Err(SessionError::Stream(e));
                }
            }

            if busy {
                backoff.reset();
            } else {
                backoff.wait();
            }
        };

        let rest = decoder.finish();
        if !rest.is_empty() {
            self.emit(Ok(rest));
        }
        result
    }

    /// Publishes one item, waiting while the consumer is behind. Queued
    /// input keeps flowing meanwhile.
    fn emit(&mut self, item: Result<String>) -> bool {
        let Pump {
            channel,
            commands,
            output,
            token,
            ..
        } = self;
        let token: &CancellationToken = token;
        publish(output, item, token, || {
            let _ = drain_commands(channel, commands, token);
        })
    }

    fn close_channel(&mut self) {
        // 关闭可重复调用，直到对端确认或超时；随后 drop 释放通道
        if let Err(e) = settle(RELEASE_TIMEOUT, || self.channel.close()) {
            debug!("Shell channel close: {}", e);
        }
    }
}

/// Writes every queued input line. `Err(())` when the input side is gone
/// for good.
fn drain_commands(
    channel: &mut Channel,
    commands: &Receiver<ShellCommand>,
    token: &CancellationToken,
) -> std::result::Result<bool, ()> {
    let mut busy = false;
    loop {
        match commands.try_recv() {
            Ok(ShellCommand::Input(bytes, reply)) => {
                busy = true;
                let written = write_and_flush(channel, &bytes, token);
                if let Err(e) = &written {
                    warn!("Shell write failed: {}", e);
                }
                let _ = reply.send(written);
            }
            Err(TryRecvError::Empty) => return Ok(busy),
            Err(TryRecvError::Disconnected) => return Err(()),
        }
    }
}

/// Hands `item` to the consumer, running `while_full` between attempts while
/// the buffer is full. False once the consumer is gone or `token` is
/// cancelled.
fn publish<T>(
    output: &mpsc::Sender<T>,
    item: T,
    token: &CancellationToken,
    mut while_full: impl FnMut(),
) -> bool {
    let mut item = item;
    let mut backoff = Backoff::new();
    loop {
        match output.try_send(item) {
            Ok(()) => return true,
            Err(TrySendError::Closed(_)) => return false,
            Err(TrySendError::Full(back)) => {
                if token.is_cancelled() {
                    return false;
                }
                item = back;
                while_full();
                backoff.wait();
            }
        }
    }
}

fn write_and_flush(channel: &mut Channel, bytes: &[u8], token: &CancellationToken) -> Result<()> {
    let mut rest = bytes;
    while !rest.is_empty() {
        let written = retry_io(token, || channel.write(rest))?;
        if written == 0 {
            return Err(SessionError::Stream(io::Error::new(
                io::ErrorKind::WriteZero,
                "shell channel accepted no bytes",
            )));
        }
        rest = &rest[written..];
    }
    retry_io(token, || channel.flush())
}

/// Turns raw reads into text without splitting a multi-byte character across
/// two chunks. Invalid sequences become U+FFFD.
#[derive(Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let complete = complete_prefix_len(&self.pending);
        let text = String::from_utf8_lossy(&self.pending[..complete]).into_owned();
        self.pending.drain(..complete);
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of the prefix that does not end inside an unfinished character.
fn complete_prefix_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if needed > back { len - back } else { len };
    }
    len
}
