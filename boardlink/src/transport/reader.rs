//! Background reader owning one physical link.
//!
//! A [`TransportReader`] runs exactly one read task per link. That task is the
//! only writer into the pull queue and the only caller of raw callbacks, so
//! every consumer observes frames in arrival order.

use std::fmt;
use std::future::Future;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, trace, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::callback::{CallbackHandle, lock};
use crate::error::{Result, TransportError};

/// Pause after a failed read before polling the link again.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Receiving half of a link.
pub trait FrameReader: Send + 'static {
    /// Unit produced by one read.
    type Frame: Send + 'static;

    /// Read the next frame. `Ok(None)` means the peer closed the link.
    ///
    /// Must be cancel-safe: the read task drops this future when asked to
    /// stop, so partially received data has to live in `self`.
    fn read_frame(&mut self) -> impl Future<Output = io::Result<Option<Self::Frame>>> + Send;
}

/// Sending half of a link.
pub trait FrameWriter: Send + 'static {
    /// What a single send accepts.
    type Outgoing: ?Sized + Sync;

    /// Write one unit. Returns whether the whole payload was written.
    fn write_frame(&mut self, out: &Self::Outgoing)
    -> impl Future<Output = io::Result<bool>> + Send;
}

/// Data produced by a link.
pub trait LinkFrame: Clone + fmt::Debug + Send + Sync + 'static {
    /// Idle frames report silence on the link. They reach raw callbacks but
    /// are never put on the pull queue.
    fn is_idle(&self) -> bool {
        false
    }

    /// Idle frame handed to raw callbacks once when the peer closes the link,
    /// if the link has one.
    fn end_of_stream() -> Option<Self> {
        None
    }
}

impl LinkFrame for Bytes {
    fn is_idle(&self) -> bool {
        self.is_empty()
    }

    fn end_of_stream() -> Option<Self> {
        Some(Bytes::new())
    }
}

/// A kind of physical link: how to open it and what flows over it.
pub trait Link: Send + Sync + 'static {
    /// Parameters used to open the link.
    type Params: Clone + fmt::Debug + Send + Sync + 'static;

    /// Received unit.
    type Frame: LinkFrame;

    /// Sent unit.
    type Outgoing: ?Sized + Sync;

    /// Receiving half.
    type Reader: FrameReader<Frame = Self::Frame>;

    /// Sending half.
    type Writer: FrameWriter<Outgoing = Self::Outgoing>;

    /// Human-readable address of the link, used in errors and logs.
    fn endpoint(params: &Self::Params) -> String;

    /// Whether frames should be put on the pull queue.
    fn enqueue_frames(params: &Self::Params) -> bool;

    /// Open and configure the link.
    fn connect(
        params: &Self::Params,
    ) -> impl Future<Output = Result<(Self::Reader, Self::Writer)>> + Send;
}

/// One received unit together with its arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<T> {
    /// Monotonic arrival counter, unique per transport.
    pub seq: u64,

    /// The received data.
    pub data: T,
}

/// Callback invoked on the read task for every frame.
pub type RawCallback<T> = Arc<dyn Fn(&Frame<T>) + Send + Sync>;

/// State shared between the transport handle and its read task.
struct Shared<T> {
    callbacks: Mutex<Vec<(CallbackHandle, RawCallback<T>)>>,
    seq: AtomicU64,
}

impl<T> Shared<T> {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Invoke every callback. The registry lock is released first so a
    /// callback may register or unregister without deadlocking.
    fn dispatch(&self, frame: &Frame<T>) {
        let callbacks: Vec<RawCallback<T>> = lock(&self.callbacks)
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(frame))).is_err() {
                error!("raw callback panicked on frame #{}", frame.seq);
            }
        }
    }
}

struct ReaderTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Exclusive owner of one physical link with a background read task.
///
/// Received frames are fanned out to raw callbacks and, unless the link is
/// configured callback-only, to an unbounded pull queue.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use boardlink::transport::{SerialConfig, SerialTransport};
///
/// # async fn example() -> Result<(), boardlink::Error> {
/// let rs485 = SerialTransport::open(SerialConfig::new("/dev/ttyUSB1")).await?;
/// rs485.send(b"\x01\x03\x00\x00\x00\x01").await?;
/// if let Some(frame) = rs485.receive(Duration::from_secs(1)).await {
///     println!("reply #{}: {:02x?}", frame.seq, frame.data);
/// }
/// # Ok(())
/// # }
/// ```
pub struct TransportReader<L: Link> {
    params: Mutex<L::Params>,
    writer: tokio::sync::Mutex<Option<L::Writer>>,
    queue_tx: mpsc::UnboundedSender<Frame<L::Frame>>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame<L::Frame>>>,
    shared: Arc<Shared<L::Frame>>,
    task: Mutex<Option<ReaderTask>>,
}

impl<L: Link> TransportReader<L> {
    /// Open the link and start the read task.
    ///
    /// Fails with [`TransportError::Connection`] if the device cannot be
    /// opened or configured.
    pub async fn open(params: L::Params) -> Result<Self> {
        let (reader, writer) = L::connect(&params).await?;
        Ok(Self::from_parts(params, reader, writer))
    }

    /// Start a transport over an already opened link.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_parts(params: L::Params, reader: L::Reader, writer: L::Writer) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let transport = Self {
            params: Mutex::new(params),
            writer: tokio::sync::Mutex::new(Some(writer)),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            shared: Arc::new(Shared {
                callbacks: Mutex::new(Vec::new()),
                seq: AtomicU64::new(0),
            }),
            task: Mutex::new(None),
        };
        transport.start(reader);
        transport
    }

    fn start(&self, reader: L::Reader) {
        let params = lock(&self.params).clone();
        let endpoint = L::endpoint(&params);
        let queue = L::enqueue_frames(&params).then(|| self.queue_tx.clone());
        let (stop, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(read_loop(
            reader,
            self.shared.clone(),
            queue,
            stop_rx,
            endpoint,
        ));

        *lock(&self.task) = Some(ReaderTask { stop, handle });
    }

    /// Signal the read task to stop and wait for it to finish.
    async fn stop_task(&self) {
        let task = lock(&self.task).take();
        if let Some(task) = task {
            let _ = task.stop.send(true);
            if let Err(e) = task.handle.await {
                warn!("reader task for {} ended abnormally: {}", self.endpoint(), e);
            }
        }
    }

    /// Address of the link.
    pub fn endpoint(&self) -> String {
        L::endpoint(&lock(&self.params))
    }

    /// Parameters the link is currently opened with.
    pub fn parameters(&self) -> L::Params {
        lock(&self.params).clone()
    }

    /// Check if the read task is running.
    pub fn is_running(&self) -> bool {
        lock(&self.task)
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Send one unit over the link.
    ///
    /// Returns whether the full payload was written; fails with
    /// [`TransportError::Write`] on I/O errors.
    pub async fn send(&self, out: &L::Outgoing) -> Result<bool> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(TransportError::NotOpen)?;

        writer.write_frame(out).await.map_err(|source| {
            TransportError::Write {
                endpoint: self.endpoint(),
                source,
            }
            .into()
        })
    }

    /// Wait up to `timeout` for the next queued frame.
    ///
    /// Returns `None` on expiry, or immediately when the link is
    /// callback-only.
    pub async fn receive(&self, timeout: Duration) -> Option<Frame<L::Frame>> {
        if !L::enqueue_frames(&lock(&self.params)) {
            return None;
        }

        let mut rx = self.queue_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Drop every queued frame.
    pub async fn flush(&self) {
        let mut rx = self.queue_rx.lock().await;
        let mut dropped = 0usize;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        trace!("flushed {} frames from {}", dropped, self.endpoint());
    }

    /// Register a callback invoked on the read task for every frame,
    /// including idle ones.
    pub fn register_callback<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&Frame<L::Frame>) + Send + Sync + 'static,
    {
        let handle = CallbackHandle::next();
        lock(&self.shared.callbacks).push((handle, Arc::new(callback)));
        handle
    }

    /// Remove a callback. Unknown handles are ignored.
    pub fn unregister_callback(&self, handle: CallbackHandle) -> bool {
        let mut callbacks = lock(&self.shared.callbacks);
        let before = callbacks.len();
        callbacks.retain(|(h, _)| *h != handle);
        let removed = callbacks.len() != before;
        if !removed {
            debug!("{} is not registered on {}", handle, L::endpoint(&lock(&self.params)));
        }
        removed
    }

    /// Remove every callback.
    pub fn clear_callbacks(&self) {
        lock(&self.shared.callbacks).clear();
    }

    /// Reopen the link with new parameters.
    ///
    /// Stops and joins the read task, closes the link, opens it again and
    /// restarts reading. Callers must not `send` or `receive` concurrently.
    /// On failure the transport stays closed.
    pub async fn reconfigure(&self, params: L::Params) -> Result<()> {
        self.stop_task().await;
        self.writer.lock().await.take();

        debug!("reconfiguring {} with {:?}", L::endpoint(&params), params);
        let (reader, writer) = L::connect(&params).await?;

        *lock(&self.params) = params;
        *self.writer.lock().await = Some(writer);
        self.start(reader);
        Ok(())
    }

    /// Stop the read task and close the link.
    pub async fn close(&self) {
        self.stop_task().await;
        self.writer.lock().await.take();
    }
}

impl<L: Link> Drop for TransportReader<L> {
    fn drop(&mut self) {
        let task = self
            .task
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.stop.send(true);
        }
    }
}

async fn read_loop<R>(
    mut reader: R,
    shared: Arc<Shared<R::Frame>>,
    queue: Option<mpsc::UnboundedSender<Frame<R::Frame>>>,
    mut stop: watch::Receiver<bool>,
    endpoint: String,
) where
    R: FrameReader,
    R::Frame: LinkFrame,
{
    debug!("reader for {} started", endpoint);

    loop {
        let result = tokio::select! {
            biased;
            _ = stop.changed() => break,
            result = reader.read_frame() => result,
        };

        match result {
            Ok(Some(data)) => {
                let frame = Frame {
                    seq: shared.next_seq(),
                    data,
                };
                shared.dispatch(&frame);

                if let Some(queue) = &queue {
                    if !frame.data.is_idle() {
                        let _ = queue.send(frame);
                    }
                }
            }
            Ok(None) => {
                warn!("link {} closed by peer", endpoint);
                if let Some(data) = R::Frame::end_of_stream() {
                    shared.dispatch(&Frame {
                        seq: shared.next_seq(),
                        data,
                    });
                }
                break;
            }
            Err(e) => {
                warn!("failed to read from {}: {}", endpoint, e);
                tokio::time::sleep(READ_ERROR_BACKOFF).await;
            }
        }
    }

    debug!("reader for {} stopped", endpoint);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::test_support::loopback;

    #[tokio::test]
    async fn test_frames_reach_queue_and_callbacks_in_order() {
        let (transport, mut board) = loopback(true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        transport.register_callback(move |frame: &Frame<Bytes>| {
            if !frame.data.is_empty() {
                lock(&sink).push(frame.seq);
            }
        });

        board.write_all(b"first").await.unwrap();
        let first = transport.receive(Duration::from_secs(2)).await.unwrap();
        board.write_all(b"second").await.unwrap();
        let second = transport.receive(Duration::from_secs(2)).await.unwrap();

        assert_eq!(first.data, Bytes::from_static(b"first"));
        assert_eq!(second.data, Bytes::from_static(b"second"));
        assert!(second.seq > first.seq);
        assert_eq!(*lock(&seen), vec![first.seq, second.seq]);
    }

    #[tokio::test]
    async fn test_peer_close_reaches_callbacks_as_idle_frame() {
        let (transport, mut board) = loopback(true);
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        transport.register_callback(move |frame: &Frame<Bytes>| {
            lock(&sink).push(frame.data.clone());
        });

        board.write_all(b"bye").await.unwrap();
        board.shutdown().await.unwrap();
        drop(board);

        assert_eq!(
            transport.receive(Duration::from_secs(2)).await.unwrap().data,
            Bytes::from_static(b"bye")
        );
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!transport.is_running());
        assert_eq!(lock(&frames).last(), Some(&Bytes::new()));
        // The closing frame is never queued
        assert!(transport.receive(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn test_receive_times_out_with_none() {
        let (transport, _board) = loopback(true);
        assert!(transport.receive(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn test_callback_only_link_never_queues() {
        let (transport, mut board) = loopback(false);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        transport.register_callback(move |frame: &Frame<Bytes>| {
            if !frame.data.is_empty() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        board.write_all(b"boot log").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(transport.receive(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_noop() {
        let (transport, _board) = loopback(true);
        let handle = transport.register_callback(|_: &Frame<Bytes>| {});
        assert!(transport.unregister_callback(handle));
        assert!(!transport.unregister_callback(handle));
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_stop_reader() {
        let (transport, mut board) = loopback(true);
        transport.register_callback(|frame: &Frame<Bytes>| {
            if !frame.data.is_empty() {
                panic!("callback failure");
            }
        });

        board.write_all(b"one").await.unwrap();
        assert!(transport.receive(Duration::from_secs(2)).await.is_some());
        board.write_all(b"two").await.unwrap();
        assert!(transport.receive(Duration::from_secs(2)).await.is_some());
        assert!(transport.is_running());
    }

    #[tokio::test]
    async fn test_flush_drops_queued_frames() {
        let (transport, mut board) = loopback(true);
        board.write_all(b"stale").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        transport.flush().await;
        assert!(transport.receive(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        use tokio::io::AsyncReadExt;

        let (transport, mut board) = loopback(true);
        assert!(transport.send(b"reboot\n").await.unwrap());

        let mut buf = [0u8; 7];
        board.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reboot\n");
    }

    #[tokio::test]
    async fn test_close_stops_task_and_rejects_send() {
        let (transport, _board) = loopback(true);
        transport.close().await;

        assert!(!transport.is_running());
        assert!(transport.send(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_reconfigure_leaves_transport_closed() {
        let (transport, _board) = loopback(true);
        let params = transport.parameters();

        let result = transport.reconfigure(params).await;
        assert!(matches!(
            result,
            Err(crate::Error::Transport(TransportError::Connection { .. }))
        ));
        assert!(!transport.is_running());
    }
}
