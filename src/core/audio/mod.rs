//! Generation-gated audio output.
//!
//! The back-end announces each speech stream with a `speech_id` and then sends
//! its PCM frames. Every frame is queued together with the generation it was
//! received under; the playback consumer writes a frame to the device only if
//! that generation is still the live one when the frame is dequeued.
//! [`AudioSink::reset`] clears the live generation, cancels the consumer,
//! reopens the device and starts over with an empty queue, so audio from a
//! superseded turn can never reach the speaker.
//!
//! | Task | Touches |
//! |---|---|
//! | session receiver loop | [`AudioSink::put`], [`AudioSink::set_generation`] |
//! | turn processor | [`AudioSink::reset`] before every turn |
//! | playback consumer | device writes, gated by the live generation |

pub mod device;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use device::{AudioDevice, LocalAudioDevice, PcmFormat};

/// Errors from the audio output device.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AudioError {
    /// The output device could not be opened
    #[error("Failed to open audio output stream: {0}")]
    OutputStreamError(String),

    /// The device is closed or failed to reopen
    #[error("Audio device unavailable")]
    DeviceUnavailable,

    /// Writing a frame failed
    #[error("Audio write failed: {0}")]
    WriteError(String),

    /// The audio thread exited unexpectedly
    #[error("Audio thread died unexpectedly")]
    AudioThreadDied,
}

/// Result type for audio operations.
pub type AudioResult<T> = Result<T, AudioError>;

#[derive(Debug)]
struct QueuedFrame {
    generation: String,
    data: Bytes,
}

struct Consumer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct FrameQueue {
    tx: mpsc::UnboundedSender<QueuedFrame>,
    /// Receiver waiting for a consumer; `None` while a consumer owns it
    rx: Option<mpsc::UnboundedReceiver<QueuedFrame>>,
    consumer: Option<Consumer>,
}

impl FrameQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Some(rx),
            consumer: None,
        }
    }
}

struct SinkInner {
    device: Option<Arc<dyn AudioDevice>>,
    live: Arc<ArcSwapOption<String>>,
    queue: Mutex<FrameQueue>,
    /// Held for the whole of a reset so overlapping resets run one at a time
    reset_lock: tokio::sync::Mutex<()>,
    stopped: AtomicBool,
}

/// Generation-gated playback queue in front of one output device.
///
/// Cloning is cheap; all clones share the same device, queue and generation.
/// A sink built without a device (see [`AudioSink::disabled`]) accepts every
/// call and plays nothing.
#[derive(Clone)]
pub struct AudioSink {
    inner: Arc<SinkInner>,
}

impl std::fmt::Debug for AudioSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSink")
            .field("available", &self.is_available())
            .field("generation", &self.generation())
            .finish()
    }
}

impl AudioSink {
    /// Create a sink that plays through `device`.
    pub fn new(device: Arc<dyn AudioDevice>) -> Self {
        Self::with_device(Some(device))
    }

    /// Create a sink with no device. Every operation is a no-op.
    pub fn disabled() -> Self {
        Self::with_device(None)
    }

    /// Open the default output device, degrading to a disabled sink when it
    /// cannot be opened.
    pub fn open_default(format: PcmFormat) -> Self {
        match LocalAudioDevice::open(format) {
            Ok(device) => {
                tracing::info!(
                    sample_rate = format.sample_rate,
                    channels = format.channels,
                    "Audio playback initialized"
                );
                Self::new(Arc::new(device))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Audio initialization failed, playback disabled");
                Self::disabled()
            }
        }
    }

    fn with_device(device: Option<Arc<dyn AudioDevice>>) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                device,
                live: Arc::new(ArcSwapOption::empty()),
                queue: Mutex::new(FrameQueue::new()),
                reset_lock: tokio::sync::Mutex::new(()),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Whether an output device is attached.
    pub fn is_available(&self) -> bool {
        self.inner.device.is_some() && !self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Start the playback consumer. Calling it again while a consumer is
    /// running does nothing.
    pub fn start(&self) {
        let Some(device) = self.inner.device.clone() else {
            return;
        };
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }

        let mut queue = self.inner.queue.lock();
        if queue
            .consumer
            .as_ref()
            .is_some_and(|consumer| !consumer.handle.is_finished())
        {
            return;
        }
        let Some(rx) = queue.rx.take() else {
            return;
        };

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_consumer(
            rx,
            device,
            self.inner.live.clone(),
            cancel.clone(),
        ));
        queue.consumer = Some(Consumer { cancel, handle });
        tracing::debug!("Audio playback consumer started");
    }

    /// Queue one frame received under `generation`. Never blocks.
    pub fn put(&self, generation: impl Into<String>, data: Bytes) {
        if !self.is_available() {
            return;
        }
        let frame = QueuedFrame {
            generation: generation.into(),
            data,
        };
        if self.inner.queue.lock().tx.send(frame).is_err() {
            tracing::trace!("Audio queue closed, frame dropped");
        }
    }

    /// Make `generation` the live one; its frames become eligible.
    pub fn set_generation(&self, generation: impl Into<String>) {
        self.inner.live.store(Some(Arc::new(generation.into())));
    }

    /// Clear the live generation; no frame is eligible until the next
    /// [`set_generation`](Self::set_generation).
    pub fn clear_generation(&self) {
        self.inner.live.store(None);
    }

    /// The live generation, if any.
    pub fn generation(&self) -> Option<String> {
        self.inner.live.load_full().map(|g| g.as_ref().clone())
    }

    /// Discard all queued and in-flight audio.
    ///
    /// When this returns the consumer has stopped, the device has been
    /// reopened, the queue is empty, a fresh consumer is running and no
    /// generation is live. A generation announced while the reset is in
    /// progress does not survive it. Safe to call repeatedly, concurrently
    /// with itself and with [`put`](Self::put).
    pub async fn reset(&self) {
        self.inner.live.store(None);

        let Some(device) = self.inner.device.clone() else {
            return;
        };
        let _serial = self.inner.reset_lock.lock().await;
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }

        let consumer = self.inner.queue.lock().consumer.take();
        if let Some(consumer) = consumer {
            shutdown_consumer(consumer).await;
        }

        // Reopening the output can block on the audio thread
        match tokio::task::spawn_blocking(move || device.reopen()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Audio stream reset failed"),
            Err(e) => tracing::warn!(error = %e, "Audio stream reset task failed"),
        }

        {
            let mut queue = self.inner.queue.lock();
            let (tx, rx) = mpsc::unbounded_channel();
            queue.tx = tx;
            queue.rx = Some(rx);
        }

        self.start();
        self.inner.live.store(None);
        tracing::debug!("Audio sink reset");
    }

    /// Stop playback for good and release the device.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.live.store(None);

        let consumer = {
            let mut queue = self.inner.queue.lock();
            queue.rx = None;
            queue.consumer.take()
        };
        if let Some(consumer) = consumer {
            shutdown_consumer(consumer).await;
        }

        if let Some(device) = &self.inner.device {
            device.close();
            tracing::info!("Audio playback stopped");
        }
    }
}

async fn shutdown_consumer(consumer: Consumer) {
    consumer.cancel.cancel();
    if let Err(e) = consumer.handle.await
        && !e.is_cancelled()
    {
        tracing::warn!(error = %e, "Audio consumer ended abnormally");
    }
}

async fn run_consumer(
    mut rx: mpsc::UnboundedReceiver<QueuedFrame>,
    device: Arc<dyn AudioDevice>,
    live: Arc<ArcSwapOption<String>>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let eligible = live
            .load_full()
            .is_some_and(|current| *current == frame.generation);
        if !eligible {
            tracing::trace!(generation = %frame.generation, "Dropping frame from stale generation");
            continue;
        }

        // Writes are paced by the device, so they run off the async workers
        let writer = device.clone();
        match tokio::task::spawn_blocking(move || writer.write(frame.data)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Audio playback error"),
            Err(e) => tracing::warn!(error = %e, "Audio write task failed"),
        }
    }
    tracing::debug!("Audio playback consumer stopped");
}
