//! Local speaker output through `rodio`.
//!
//! `rodio::OutputStream` is `!Send` on some platforms, so the stream and its
//! sink live on a dedicated OS thread. [`LocalAudioDevice`] is the
//! `Send + Sync` proxy that forwards every operation to that thread over a
//! channel.
//!
//! A write is acknowledged only once rodio holds at most
//! [`MAX_BUFFERED_FRAMES`] buffers, so the backlog of a fast back-end stays in
//! the generation-gated queue in front of the device instead of inside rodio.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamHandle, Sink};

use super::{AudioError, AudioResult};

/// Default back-end sample rate.
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Default channel count (mono).
pub const DEFAULT_CHANNELS: u16 = 1;

/// Buffers rodio may hold ahead of the speaker.
pub const MAX_BUFFERED_FRAMES: usize = 2;

const PACING_POLL: Duration = Duration::from_millis(5);

/// Longest a single write waits for the output to drain.
const MAX_PACING_WAIT: Duration = Duration::from_secs(5);

/// Layout of the signed 16-bit little-endian PCM the back-end streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
        }
    }
}

/// An output device accepting raw PCM frames.
pub trait AudioDevice: Send + Sync {
    /// Play one frame. May block until the device has room for it.
    fn write(&self, frame: Bytes) -> AudioResult<()>;

    /// Drop everything buffered and reopen the output.
    fn reopen(&self) -> AudioResult<()>;

    /// Release the device. Later writes fail.
    fn close(&self);
}

enum DeviceCommand {
    Write {
        frame: Bytes,
        reply: mpsc::Sender<AudioResult<()>>,
    },
    Reopen {
        reply: mpsc::Sender<AudioResult<()>>,
    },
    Shutdown,
}

/// The default system output device, driven from its own thread.
pub struct LocalAudioDevice {
    cmd_tx: mpsc::Sender<DeviceCommand>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl LocalAudioDevice {
    /// Spawn the audio thread and open the default output device on it.
    pub fn open(format: PcmFormat) -> AudioResult<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<DeviceCommand>();
        let (init_tx, init_rx) = mpsc::channel::<AudioResult<()>>();

        let thread = thread::Builder::new()
            .name("bridge-audio".into())
            .spawn(move || run(format, cmd_rx, init_tx))
            .map_err(|e| {
                AudioError::OutputStreamError(format!("failed to spawn audio thread: {e}"))
            })?;

        init_rx.recv().map_err(|_| AudioError::AudioThreadDied)??;

        Ok(Self {
            cmd_tx,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn send_and_recv(
        &self,
        build: impl FnOnce(mpsc::Sender<AudioResult<()>>) -> DeviceCommand,
    ) -> AudioResult<()> {
        let (tx, rx) = mpsc::channel();
        self.cmd_tx
            .send(build(tx))
            .map_err(|_| AudioError::DeviceUnavailable)?;
        rx.recv().map_err(|_| AudioError::AudioThreadDied)?
    }
}

impl AudioDevice for LocalAudioDevice {
    fn write(&self, frame: Bytes) -> AudioResult<()> {
        self.send_and_recv(|reply| DeviceCommand::Write { frame, reply })
    }

    fn reopen(&self) -> AudioResult<()> {
        self.send_and_recv(|reply| DeviceCommand::Reopen { reply })
    }

    fn close(&self) {
        let _ = self.cmd_tx.send(DeviceCommand::Shutdown);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LocalAudioDevice {
    fn drop(&mut self) {
        self.close();
    }
}

/// Output stream plus the sink frames are appended to.
struct OpenOutput {
    _stream: OutputStream,
    _handle: OutputStreamHandle,
    sink: Sink,
}

impl OpenOutput {
    fn open() -> AudioResult<Self> {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| AudioError::OutputStreamError(e.to_string()))?;
        let sink =
            Sink::try_new(&handle).map_err(|e| AudioError::OutputStreamError(e.to_string()))?;
        Ok(Self {
            _stream: stream,
            _handle: handle,
            sink,
        })
    }
}

fn run(
    format: PcmFormat,
    cmd_rx: mpsc::Receiver<DeviceCommand>,
    init_tx: mpsc::Sender<AudioResult<()>>,
) {
    let mut output = match OpenOutput::open() {
        Ok(output) => Some(output),
        Err(e) => {
            let _ = init_tx.send(Err(e));
            return;
        }
    };
    if init_tx.send(Ok(())).is_err() {
        return;
    }

    let mut pending = PcmAssembler::default();

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            DeviceCommand::Write { frame, reply } => {
                let result = match &output {
                    Some(output) => {
                        let samples = pending.push(&frame);
                        if !samples.is_empty() {
                            output.sink.append(SamplesBuffer::new(
                                format.channels,
                                format.sample_rate,
                                samples,
                            ));
                        }
                        if !wait_for_room(
                            || output.sink.len(),
                            MAX_BUFFERED_FRAMES,
                            PACING_POLL,
                            MAX_PACING_WAIT,
                        ) {
                            tracing::warn!(
                                buffered = output.sink.len(),
                                "Audio output is not draining"
                            );
                        }
                        Ok(())
                    }
                    None => Err(AudioError::DeviceUnavailable),
                };
                let _ = reply.send(result);
            }

            DeviceCommand::Reopen { reply } => {
                if let Some(old) = output.take() {
                    old.sink.stop();
                }
                pending.clear();
                let result = OpenOutput::open().map(|fresh| {
                    output = Some(fresh);
                });
                let _ = reply.send(result);
            }

            DeviceCommand::Shutdown => break,
        }
    }

    if let Some(output) = output.take() {
        output.sink.stop();
    }
    tracing::debug!("Audio thread shutting down");
}

/// Block until `buffered()` is at most `limit`, polling every `poll`.
/// Returns `false` if `max_wait` passes first.
fn wait_for_room(
    buffered: impl Fn() -> usize,
    limit: usize,
    poll: Duration,
    max_wait: Duration,
) -> bool {
    let started = Instant::now();
    while buffered() > limit {
        if started.elapsed() >= max_wait {
            return false;
        }
        thread::sleep(poll);
    }
    true
}

/// Turns arbitrary byte chunks into whole `i16` samples, carrying an odd
/// trailing byte over to the next chunk.
#[derive(Debug, Default)]
struct PcmAssembler {
    carry: Option<u8>,
}

impl PcmAssembler {
    fn push(&mut self, data: &[u8]) -> Vec<i16> {
        let mut samples = Vec::with_capacity(data.len().div_ceil(2));
        let mut rest = data;

        if let Some(low) = self.carry.take() {
            match rest.split_first() {
                Some((&high, tail)) => {
                    samples.push(i16::from_le_bytes([low, high]));
                    rest = tail;
                }
                None => {
                    self.carry = Some(low);
                    return samples;
                }
            }
        }

        let mut chunks = rest.chunks_exact(2);
        samples.extend(chunks.by_ref().map(|pair| i16::from_le_bytes([pair[0], pair[1]])));
        if let [odd] = chunks.remainder() {
            self.carry = Some(*odd);
        }
        samples
    }

    fn clear(&mut self) {
        self.carry = None;
    }
}
