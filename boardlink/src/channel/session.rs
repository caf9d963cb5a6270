//! Line-oriented console session on top of a byte transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, trace, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::callbacks::{CallbackRegistry, SkipSet};
use super::decoder::LineDecoder;
use super::patterns::{PatternSet, PromptShapes};
use crate::callback::{CallbackHandle, lock};
use crate::error::Result;
use crate::transport::{Frame, Link, SerialConfig, SerialLink, TransportReader};

/// Line terminator appended by [`ConsoleSession::send`].
pub const DEFAULT_EOL: &str = "\n";

/// State touched by the transport's read task for every frame.
struct Pipeline {
    decoder: Mutex<LineDecoder>,
    callbacks: CallbackRegistry,
    skip: SkipSet,
    queue: mpsc::UnboundedSender<String>,
}

impl Pipeline {
    /// Decode a frame and push every completed line through
    /// skip check, callback dispatch and enqueue, in that order.
    fn ingest(&self, chunk: &[u8]) {
        let lines = lock(&self.decoder).feed(chunk);
        if lines.is_empty() {
            return;
        }
        debug!("console received: {:?}", lines);

        for line in lines {
            if self.skip.is_skipped(&line) {
                trace!("skipped {:?}", line);
                continue;
            }
            self.callbacks.dispatch(&line);
            let _ = self.queue.send(line);
        }
    }
}

/// Console session decoding a byte link into logical lines.
///
/// Lines are delivered two ways: pulled one at a time with
/// [`receive`](Self::receive), and pushed synchronously to callbacks
/// registered with a [`PatternSet`] filter. Every line passes through the
/// skip list first; a skipped line reaches neither.
///
/// The session is meant to be shared: construct it once, wrap it in an `Arc`
/// and hand it to every consumer. At most one consumer should pull from it at
/// a time; concurrent listeners should use callbacks.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use boardlink::channel::{ConsoleSession, PatternSet, PromptShapes};
/// use boardlink::transport::SerialConfig;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let console = ConsoleSession::open(
///     SerialConfig::new("/dev/ttyUSB0"),
///     PromptShapes::for_host("imx6-board")?,
/// )
/// .await?;
///
/// console.skip_list_add(&PatternSet::new(["audit: "])?);
/// console.send("uname -r").await?;
/// let kernel = console
///     .receive(Duration::from_secs(5), Some(&PatternSet::new([r"^\d+\.\d+"])?))
///     .await;
/// println!("{kernel:?}");
/// # Ok(())
/// # }
/// ```
pub struct ConsoleSession<L = SerialLink>
where
    L: Link<Frame = Bytes, Outgoing = [u8]>,
{
    transport: TransportReader<L>,
    pipeline: Arc<Pipeline>,
    lines: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    raw_handle: CallbackHandle,
    prompts: PromptShapes,
}

impl ConsoleSession<SerialLink> {
    /// Open a console on a UART.
    ///
    /// The underlying transport runs callback-only; lines are queued by the
    /// session instead.
    pub async fn open(config: SerialConfig, prompts: PromptShapes) -> Result<Self> {
        let transport = TransportReader::open(config.callback_only()).await?;
        Ok(Self::with_transport(transport, prompts))
    }
}

impl<L> ConsoleSession<L>
where
    L: Link<Frame = Bytes, Outgoing = [u8]>,
{
    /// Build a session on an already opened transport.
    ///
    /// The transport should be callback-only, otherwise its own frame queue
    /// grows without a reader.
    pub fn with_transport(transport: TransportReader<L>, prompts: PromptShapes) -> Self {
        if L::enqueue_frames(&transport.parameters()) {
            warn!(
                "console on {} uses a queueing transport; raw frames will pile up",
                transport.endpoint()
            );
        }

        let (queue, lines) = mpsc::unbounded_channel();
        let pipeline = Arc::new(Pipeline {
            decoder: Mutex::new(LineDecoder::new(prompts.clone())),
            callbacks: CallbackRegistry::new(),
            skip: SkipSet::new(),
            queue,
        });

        let sink = pipeline.clone();
        let raw_handle =
            transport.register_callback(move |frame: &Frame<Bytes>| sink.ingest(&frame.data));

        Self {
            transport,
            pipeline,
            lines: tokio::sync::Mutex::new(lines),
            raw_handle,
            prompts,
        }
    }

    /// Prompt shapes recognised by the decoder.
    pub fn prompts(&self) -> &PromptShapes {
        &self.prompts
    }

    /// The underlying transport.
    pub fn transport(&self) -> &TransportReader<L> {
        &self.transport
    }

    /// Parameters the link is opened with.
    pub fn parameters(&self) -> L::Params {
        self.transport.parameters()
    }

    /// Wait up to `timeout` for the next line.
    ///
    /// With a matcher, lines that do not match are consumed and dropped until
    /// a matching one arrives or the overall deadline passes. This assumes a
    /// single pulling consumer: a second waiter would lose the lines this one
    /// discards. Waiting for another puller to finish counts against
    /// `timeout`.
    pub async fn receive(&self, timeout: Duration, matcher: Option<&PatternSet>) -> Option<String> {
        let deadline = Instant::now() + timeout;
        let Ok(mut lines) = tokio::time::timeout_at(deadline, self.lines.lock()).await else {
            debug!("console busy with another receive for {:?}", timeout);
            return None;
        };

        loop {
            let line = tokio::time::timeout_at(deadline, lines.recv())
                .await
                .ok()
                .flatten()?;

            match matcher {
                Some(matcher) if !matcher.is_match(&line) => {
                    trace!("discarding {:?} while waiting for {:?}", line, matcher);
                }
                _ => return Some(line),
            }
        }
    }

    /// Send a line terminated by [`DEFAULT_EOL`].
    pub async fn send(&self, text: &str) -> Result<bool> {
        self.send_with_eol(text, DEFAULT_EOL).await
    }

    /// Send a line with a custom terminator.
    pub async fn send_with_eol(&self, text: &str, eol: &str) -> Result<bool> {
        debug!("console send: {:?}", text);
        self.write(text, eol).await
    }

    /// Send a line without logging its content.
    pub async fn send_hidden(&self, text: &str) -> Result<bool> {
        debug!("console send: {:?}", "*".repeat(text.chars().count()));
        self.write(text, DEFAULT_EOL).await
    }

    async fn write(&self, text: &str, eol: &str) -> Result<bool> {
        let mut out = Vec::with_capacity(text.len() + eol.len());
        out.extend_from_slice(text.as_bytes());
        out.extend_from_slice(eol.as_bytes());
        self.transport.send(&out).await
    }

    /// Drop every queued line.
    pub async fn flush(&self) {
        let mut lines = self.lines.lock().await;
        let mut dropped = 0usize;
        while lines.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            trace!("flushed {} console lines", dropped);
        }
    }

    /// Register a callback run on the read task for every line passing
    /// `filter`. Callbacks run in registration order and must not block.
    pub fn register_callback<F>(&self, callback: F, filter: PatternSet) -> CallbackHandle
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.pipeline.callbacks.register(Arc::new(callback), filter)
    }

    /// Add patterns to an existing callback's filter.
    pub fn extend_callback(&self, handle: CallbackHandle, filter: &PatternSet) -> bool {
        self.pipeline.callbacks.extend(handle, filter)
    }

    /// Remove a callback, or narrow its filter.
    ///
    /// See [`CallbackRegistry::unregister`]. Unknown handles are ignored.
    pub fn unregister_callback(&self, handle: CallbackHandle, filter: Option<&PatternSet>) -> bool {
        self.pipeline.callbacks.unregister(handle, filter)
    }

    /// Remove every line callback.
    pub fn clear_callbacks(&self) {
        self.pipeline.callbacks.clear();
    }

    /// Suppress lines matching `patterns`.
    pub fn skip_list_add(&self, patterns: &PatternSet) {
        self.pipeline.skip.add(patterns);
    }

    /// Stop suppressing lines matching `patterns`.
    pub fn skip_list_remove(&self, patterns: &PatternSet) {
        self.pipeline.skip.remove(patterns);
    }

    /// Stop suppressing anything.
    pub fn skip_list_clear(&self) {
        self.pipeline.skip.clear();
    }

    /// Detach from the transport and close it.
    pub async fn close(&self) {
        self.transport.unregister_callback(self.raw_handle);
        self.transport.close().await;
        lock(&self.pipeline.decoder).reset();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::test_support::console;

    const WAIT: Duration = Duration::from_secs(2);

    fn set(patterns: &[&str]) -> PatternSet {
        PatternSet::new(patterns).unwrap()
    }

    #[tokio::test]
    async fn test_prompt_without_terminator_is_a_line() {
        let (session, mut board) = console();
        board.write_all(b"root@host:~# ").await.unwrap();

        assert_eq!(session.receive(WAIT, None).await.as_deref(), Some("root@host:~# "));
        // Silence afterwards produces nothing more
        assert!(session.receive(Duration::from_millis(300), None).await.is_none());
    }

    #[tokio::test]
    async fn test_fragment_flushed_after_silence() {
        let (session, mut board) = console();
        board.write_all(b"Hit any key to stop autoboot").await.unwrap();

        assert_eq!(
            session.receive(WAIT, None).await.as_deref(),
            Some("Hit any key to stop autoboot")
        );
    }

    #[tokio::test]
    async fn test_fragment_flushed_when_board_closes() {
        let (session, mut board) = console();
        board.write_all(b"last words").await.unwrap();
        board.shutdown().await.unwrap();
        drop(board);

        assert_eq!(session.receive(WAIT, None).await.as_deref(), Some("last words"));
    }

    #[tokio::test]
    async fn test_second_receive_keeps_its_own_timeout() {
        let (session, _board) = console();

        let (first, (second, waited)) = tokio::join!(
            session.receive(Duration::from_secs(1), None),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let start = std::time::Instant::now();
                let line = session.receive(Duration::from_millis(100), None).await;
                (line, start.elapsed())
            }
        );

        assert!(first.is_none());
        assert!(second.is_none());
        assert!(waited < Duration::from_millis(500), "waited {waited:?}");
    }

    #[tokio::test]
    async fn test_receive_with_matcher_discards_others() {
        let (session, mut board) = console();
        board
            .write_all(b"noise one\r\nnoise two\r\nhost login: ")
            .await
            .unwrap();

        let login = session.receive(WAIT, Some(&set(&["login: $"]))).await;
        assert_eq!(login.as_deref(), Some("host login: "));
        assert!(session.receive(Duration::from_millis(300), None).await.is_none());
    }

    #[tokio::test]
    async fn test_receive_with_matcher_times_out() {
        let (session, mut board) = console();
        board.write_all(b"unrelated\r\n").await.unwrap();
        assert!(
            session
                .receive(Duration::from_millis(300), Some(&set(&["never"])))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_skipped_lines_reach_nobody() {
        let (session, mut board) = console();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        session.register_callback(
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            PatternSet::MatchAll,
        );
        session.skip_list_add(&set(&["crng init"]));

        board
            .write_all(b"random: crng init done\r\nkept\r\n")
            .await
            .unwrap();

        assert_eq!(session.receive(WAIT, None).await.as_deref(), Some("kept"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(session.receive(Duration::from_millis(300), None).await.is_none());
    }

    #[tokio::test]
    async fn test_callback_runs_before_enqueue() {
        let (session, mut board) = console();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.register_callback(
            move |line| lock(&sink).push(line.to_string()),
            set(&["ready"]),
        );

        board
            .write_all(b"eth0: link becomes ready\r\nother\r\n")
            .await
            .unwrap();

        let first = session.receive(WAIT, None).await.unwrap();
        assert_eq!(first, "eth0: link becomes ready");
        assert_eq!(*lock(&seen), vec![first]);
    }

    #[tokio::test]
    async fn test_unregister_with_same_filter_stops_dispatch() {
        let (session, mut board) = console();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let filter = set(&["tick"]);
        let handle = session.register_callback(
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            filter.clone(),
        );

        board.write_all(b"tick\r\n").await.unwrap();
        session.receive(WAIT, None).await.unwrap();
        assert!(session.unregister_callback(handle, Some(&filter)));

        board.write_all(b"tick\r\n").await.unwrap();
        session.receive(WAIT, None).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_appends_eol() {
        let (session, mut board) = console();
        assert!(session.send("reboot").await.unwrap());
        assert!(session.send_with_eol("\x03", "").await.unwrap());

        let mut buf = [0u8; 8];
        board.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reboot\n\x03");
    }

    #[tokio::test]
    async fn test_flush_drops_queued_lines() {
        let (session, mut board) = console();
        board.write_all(b"old\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        session.flush().await;
        assert!(session.receive(Duration::from_millis(100), None).await.is_none());
    }
}
