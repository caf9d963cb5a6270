//! D-Bus signal subscriptions and method calls over the console.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use indexmap::IndexMap;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use super::assembler::{SignalAssembler, SignalRecord};
use super::catalog::{self, DbusValue, SignalCatalog};
use crate::callback::{CallbackHandle, lock};
use crate::channel::{ConsoleSession, PatternSet};
use crate::error::{ProtocolViolation, Result};
use crate::platform::Timeouts;
use crate::transport::{Link, SerialLink};

/// Violations kept until [`SignalCorrelator::take_violations`]; older ones
/// are dropped first.
pub const MAX_VIOLATIONS: usize = 64;

/// State driven from the console callback.
struct Correlation {
    catalog: Arc<SignalCatalog>,
    assembler: Mutex<SignalAssembler>,
    violations: Mutex<VecDeque<ProtocolViolation>>,
    delivered: mpsc::UnboundedSender<SignalRecord>,
}

impl Correlation {
    fn on_line(&self, line: &str) {
        let outcome = lock(&self.assembler).feed(line, &self.catalog);
        match outcome {
            Ok(Some(record)) => {
                debug!("signal {} delivered with {:?}", record.name, record.results);
                let _ = self.delivered.send(record);
            }
            Ok(None) => {}
            Err(violation) => {
                let mut violations = lock(&self.violations);
                if violations.len() == MAX_VIOLATIONS {
                    violations.pop_front();
                }
                violations.push_back(violation);
            }
        }
    }
}

/// Watches D-Bus signals and calls D-Bus methods through the console shell.
///
/// Signals are correlated from the console's line stream by a callback: a
/// header line naming a signal known to the [`SignalCatalog`] starts a
/// record, and the record is delivered once its results have been printed.
/// Delivered records are pulled with [`get_signal`](Self::get_signal).
///
/// Correlation does not depend on subscriptions: a catalog signal printed by
/// any monitor on the console is delivered, subscribed or not.
///
/// Subscriptions start one `dbus-monitor` per signal in the background of the
/// shell; the shell must be logged in.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use boardlink::channel::{ConsoleSession, PromptShapes};
/// use boardlink::dbus::{SignalCatalog, SignalCorrelator};
/// use boardlink::platform::Timeouts;
/// use boardlink::transport::SerialConfig;
///
/// # async fn example() -> Result<(), boardlink::Error> {
/// let console = Arc::new(
///     ConsoleSession::open(SerialConfig::new("/dev/ttyUSB0"), PromptShapes::any_host()).await?,
/// );
/// let dbus = SignalCorrelator::new(console, SignalCatalog::firmware_manager(), Timeouts::default());
///
/// dbus.subscribe("newFirmwareAvailable").await?;
/// dbus.run_method("forceFirmwareUpdate", None, false).await?;
/// if let Some(signal) = dbus.get_signal(Duration::from_secs(60)).await {
///     println!("{} -> {:?}", signal.name, signal.results);
/// }
/// dbus.clear_subscriptions().await?;
/// # Ok(())
/// # }
/// ```
pub struct SignalCorrelator<L = SerialLink>
where
    L: Link<Frame = Bytes, Outgoing = [u8]>,
{
    console: Arc<ConsoleSession<L>>,
    correlation: Arc<Correlation>,
    signals: tokio::sync::Mutex<mpsc::UnboundedReceiver<SignalRecord>>,
    subscriptions: Mutex<IndexMap<String, u32>>,
    timeouts: Timeouts,
    handle: CallbackHandle,
}

impl<L> SignalCorrelator<L>
where
    L: Link<Frame = Bytes, Outgoing = [u8]>,
{
    /// Attach a correlator to a console.
    pub fn new(console: Arc<ConsoleSession<L>>, catalog: SignalCatalog, timeouts: Timeouts) -> Self {
        let (delivered, signals) = mpsc::unbounded_channel();
        let catalog = Arc::new(catalog);
        let correlation = Arc::new(Correlation {
            catalog: catalog.clone(),
            assembler: Mutex::new(SignalAssembler::new()),
            violations: Mutex::new(VecDeque::new()),
            delivered,
        });

        let sink = correlation.clone();
        let handle = console.register_callback(move |line| sink.on_line(line), catalog.record_lines());

        Self {
            console,
            correlation,
            signals: tokio::sync::Mutex::new(signals),
            subscriptions: Mutex::new(IndexMap::new()),
            timeouts,
            handle,
        }
    }

    /// The catalog signals are correlated against.
    pub fn catalog(&self) -> &SignalCatalog {
        &self.correlation.catalog
    }

    /// Signals currently subscribed to.
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).keys().cloned().collect()
    }

    /// Start a background monitor for `signal`.
    ///
    /// Returns false if the signal is already subscribed or the shell did not
    /// acknowledge the monitor in time.
    pub async fn subscribe(&self, signal: &str) -> Result<bool> {
        if lock(&self.subscriptions).contains_key(signal) {
            warn!("already subscribed to signal '{}'", signal);
            return Ok(false);
        }

        self.console.flush().await;
        self.console
            .send(&self.catalog().monitor_command(signal))
            .await?;

        let pid = self
            .console
            .receive(self.timeouts.dbus_subscribe, Some(&catalog::subscription_ack()))
            .await
            .and_then(|line| catalog::parse_subscription_ack(&line));

        match pid {
            Some(pid) => {
                info!("subscribed to '{}' (monitor pid {})", signal, pid);
                lock(&self.subscriptions).insert(signal.to_string(), pid);
                Ok(true)
            }
            None => {
                warn!("no acknowledgement subscribing to signal '{}'", signal);
                Ok(false)
            }
        }
    }

    /// Stop the monitor of `signal`.
    ///
    /// The monitor process is looked up first and killed only if it is still
    /// running. Returns false if the signal was not subscribed.
    pub async fn unsubscribe(&self, signal: &str) -> Result<bool> {
        let Some(pid) = lock(&self.subscriptions).get(signal).copied() else {
            warn!("no subscription for signal '{}'", signal);
            return Ok(false);
        };

        let catalog = self.catalog();
        let timeout = self.timeouts.dbus_unsubscribe;

        self.console.flush().await;
        self.console
            .send(&catalog.process_check_command(pid))
            .await?;

        let running = self
            .console
            .receive(timeout, Some(&catalog.monitor_process(pid)))
            .await
            .is_some();

        if running {
            self.console.send(&catalog.kill_command(pid)).await?;
            let shell = PatternSet::from(&self.console.prompts().shell);
            if self.console.receive(timeout, Some(&shell)).await.is_none() {
                warn!("no prompt after stopping monitor {}", pid);
            }
        } else {
            debug!("monitor {} for '{}' already gone", pid, signal);
        }

        lock(&self.subscriptions).shift_remove(signal);
        info!("unsubscribed from '{}'", signal);
        Ok(true)
    }

    /// Unsubscribe from every signal.
    pub async fn clear_subscriptions(&self) -> Result<()> {
        for signal in self.subscriptions() {
            self.unsubscribe(&signal).await?;
        }
        Ok(())
    }

    /// Call a method, optionally with one string argument.
    ///
    /// With `expect_return` false the call returns `None` right after sending.
    /// Otherwise it waits for a line shaped like the method's reply and
    /// decodes it; `None` if no reply arrives or the method has no known
    /// reply shape.
    pub async fn run_method(
        &self,
        method: &str,
        parameter: Option<&str>,
        expect_return: bool,
    ) -> Result<Option<DbusValue>> {
        let catalog = self.catalog();

        self.console.flush().await;
        self.console
            .send(&catalog.method_command(method, parameter))
            .await?;

        if !expect_return {
            return Ok(None);
        }

        let Some(reply) = catalog.reply_shape(method) else {
            warn!("no reply shape known for method '{}'", method);
            return Ok(None);
        };

        let reply = self
            .console
            .receive(self.timeouts.dbus_method, Some(&PatternSet::from(reply)))
            .await;

        match reply {
            Some(line) => Ok(DbusValue::decode(&line)),
            None => {
                warn!("no reply from method '{}'", method);
                Ok(None)
            }
        }
    }

    /// Wait up to `timeout` for the next delivered signal.
    pub async fn get_signal(&self, timeout: Duration) -> Option<SignalRecord> {
        let mut signals = self.signals.lock().await;
        tokio::time::timeout(timeout, signals.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait for the next delivered signal for the configured
    /// [`dbus_signal`](Timeouts::dbus_signal) timeout.
    pub async fn next_signal(&self) -> Option<SignalRecord> {
        self.get_signal(self.timeouts.dbus_signal).await
    }

    /// Drop every delivered signal and any partial record.
    pub async fn clear_signals(&self) {
        let mut signals = self.signals.lock().await;
        while signals.try_recv().is_ok() {}
        lock(&self.correlation.assembler).reset();
    }

    /// Take the protocol violations observed since the last call, oldest
    /// first. At most [`MAX_VIOLATIONS`] are kept between calls.
    pub fn take_violations(&self) -> Vec<ProtocolViolation> {
        lock(&self.correlation.violations).drain(..).collect()
    }
}

impl<L> Drop for SignalCorrelator<L>
where
    L: Link<Frame = Bytes, Outgoing = [u8]>,
{
    fn drop(&mut self) {
        self.console.unregister_callback(self.handle, None);
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    use super::*;
    use crate::test_support::{LoopbackLink, console};

    const WAIT: Duration = Duration::from_secs(2);

    fn timeouts() -> Timeouts {
        Timeouts {
            dbus_subscribe: Duration::from_millis(500),
            dbus_unsubscribe: Duration::from_millis(500),
            dbus_method: Duration::from_millis(500),
            dbus_signal: Duration::from_millis(300),
            ..Timeouts::default()
        }
    }

    fn correlator() -> (SignalCorrelator<LoopbackLink>, DuplexStream) {
        let (session, board) = console();
        let dbus = SignalCorrelator::new(
            Arc::new(session),
            SignalCatalog::firmware_manager(),
            timeouts(),
        );
        (dbus, board)
    }

    fn header(name: &str) -> String {
        format!(
            "signal time=1.0 sender=:1.7 -> destination=(null destination) serial=9 \
             path=/instance; interface=org.firmwaremanager.FirmwareInterface; member={name}\r\n"
        )
    }

    #[tokio::test]
    async fn test_single_result_signal_delivered() {
        let (dbus, mut board) = correlator();
        board.write_all(header("newFirmwareAvailable").as_bytes()).await.unwrap();
        board.write_all(b"   string \"12345\"\r\n").await.unwrap();

        let record = dbus.get_signal(WAIT).await.unwrap();
        assert_eq!(
            record,
            SignalRecord::new("newFirmwareAvailable", vec![DbusValue::from("12345")])
        );
    }

    #[tokio::test]
    async fn test_incomplete_signal_not_delivered() {
        let (dbus, mut board) = correlator();
        board.write_all(header("packageUpdateState").as_bytes()).await.unwrap();
        board.write_all(b"   string \"ui-pack\"\r\n").await.unwrap();

        assert!(dbus.get_signal(Duration::from_millis(300)).await.is_none());
    }

    #[tokio::test]
    async fn test_two_result_signal_delivered() {
        let (dbus, mut board) = correlator();
        let mut text = header("forcedPackageChecked");
        text.push_str("   string \"ui-pack\"\r\n   boolean true\r\n");
        board.write_all(text.as_bytes()).await.unwrap();

        let record = dbus.get_signal(WAIT).await.unwrap();
        assert_eq!(record.name, "forcedPackageChecked");
        assert_eq!(record.results, vec![DbusValue::from("ui-pack"), DbusValue::Bool(true)]);
    }

    #[tokio::test]
    async fn test_header_mid_record_is_reported() {
        let (dbus, mut board) = correlator();
        let mut text = header("packageUpdateState");
        text.push_str("   string \"ui-pack\"\r\n");
        text.push_str(&header("firmwareUpdateState"));
        text.push_str("   string \"Kernel Update Started\"\r\n");
        board.write_all(text.as_bytes()).await.unwrap();

        let record = dbus.get_signal(WAIT).await.unwrap();
        assert_eq!(record.name, "firmwareUpdateState");

        let violations = dbus.take_violations();
        assert_eq!(violations.len(), 1);
        assert!(dbus.take_violations().is_empty());
    }

    #[tokio::test]
    async fn test_violation_log_keeps_latest() {
        let (dbus, mut board) = correlator();
        let mut text = String::new();
        for _ in 0..MAX_VIOLATIONS + 5 {
            text.push_str(&header("packageUpdateState"));
        }
        text.push_str(&header("firmwareUpdateState"));
        text.push_str("   string \"Kernel Update Started\"\r\n");
        board.write_all(text.as_bytes()).await.unwrap();

        assert!(dbus.get_signal(WAIT).await.is_some());
        let violations = dbus.take_violations();
        assert_eq!(violations.len(), MAX_VIOLATIONS);
        assert!(matches!(
            violations.last(),
            Some(ProtocolViolation::HeaderDuringAccumulation { received, .. })
                if received == "firmwareUpdateState"
        ));
    }

    #[tokio::test]
    async fn test_next_signal_uses_configured_timeout() {
        let (dbus, mut board) = correlator();
        let start = std::time::Instant::now();
        assert!(dbus.next_signal().await.is_none());
        assert!(start.elapsed() < WAIT);

        board.write_all(header("firmwareCheckResults").as_bytes()).await.unwrap();
        board.write_all(b"   boolean true\r\n").await.unwrap();
        let record = dbus.next_signal().await.unwrap();
        assert_eq!(record.results, vec![DbusValue::Bool(true)]);
    }

    /// Answer the first command sent to the board with `reply`.
    fn reply_once(board: DuplexStream, reply: &'static [u8]) -> tokio::task::JoinHandle<String> {
        let (rx, mut tx) = tokio::io::split(board);
        tokio::spawn(async move {
            let mut lines = BufReader::new(rx).lines();
            let command = lines.next_line().await.unwrap().unwrap();
            tx.write_all(reply).await.unwrap();
            command
        })
    }

    #[tokio::test]
    async fn test_run_method_decodes_bool_reply() {
        let (dbus, board) = correlator();
        let fake = reply_once(
            board,
            b"method return time=1.0 sender=:1.3\r\n   boolean false\r\n",
        );

        let value = dbus.run_method("switchToAltFirmware", None, true).await.unwrap();
        assert_eq!(value, Some(DbusValue::Bool(false)));
        assert!(fake.await.unwrap().ends_with(".switchToAltFirmware"));
    }

    #[tokio::test]
    async fn test_run_method_decodes_true_reply() {
        let (dbus, board) = correlator();
        let fake = reply_once(
            board,
            b"method return time=1.0 sender=:1.3\r\n   boolean true\r\n",
        );

        let value = dbus.run_method("forceFirmwareUpdate", None, true).await.unwrap();
        assert_eq!(value, Some(DbusValue::Bool(true)));
        assert!(fake.await.unwrap().ends_with(".forceFirmwareUpdate"));
    }

    #[tokio::test]
    async fn test_run_method_decodes_string_reply() {
        let (dbus, board) = correlator();
        let fake = reply_once(
            board,
            b"method return time=1.0 sender=:1.3\r\n   string \"eMMC\"\r\n",
        );

        let value = dbus.run_method("getCurrentBootDev", None, true).await.unwrap();
        assert_eq!(value, Some(DbusValue::from("eMMC")));
        assert_eq!(value.as_ref().and_then(DbusValue::as_str), Some("eMMC"));
        assert!(fake.await.unwrap().ends_with(".getCurrentBootDev"));
    }

    #[tokio::test]
    async fn test_run_method_times_out() {
        let (dbus, _board) = correlator();
        let value = dbus.run_method("getCurrentBootDev", None, true).await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_run_method_without_return() {
        let (dbus, _board) = correlator();
        let value = dbus
            .run_method("forceUpdate", Some("/tmp/pkg.tar"), false)
            .await
            .unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe() {
        let (dbus, board) = correlator();
        let (rx, mut tx) = tokio::io::split(board);

        let fake = tokio::spawn(async move {
            let mut lines = BufReader::new(rx).lines();
            let monitor = lines.next_line().await.unwrap().unwrap();
            tx.write_all(b"[1] 1432\r\nroot@host:~# ").await.unwrap();

            let ps = lines.next_line().await.unwrap().unwrap();
            tx.write_all(b" 1432 root      0:00 dbus-monitor --system\r\n")
                .await
                .unwrap();

            let kill = lines.next_line().await.unwrap().unwrap();
            tx.write_all(b"root@host:~# ").await.unwrap();
            (monitor, ps, kill)
        });

        assert!(dbus.subscribe("newFirmwareAvailable").await.unwrap());
        assert!(!dbus.subscribe("newFirmwareAvailable").await.unwrap());
        assert_eq!(dbus.subscriptions(), vec!["newFirmwareAvailable".to_string()]);

        assert!(dbus.unsubscribe("newFirmwareAvailable").await.unwrap());
        assert!(dbus.subscriptions().is_empty());
        assert!(!dbus.unsubscribe("newFirmwareAvailable").await.unwrap());

        let (monitor, ps, kill) = fake.await.unwrap();
        assert!(monitor.starts_with("dbus-monitor"));
        assert!(monitor.contains("member='newFirmwareAvailable'"));
        assert_eq!(ps, "ps | grep 1432");
        assert_eq!(kill, "kill 1432");
    }

    #[tokio::test]
    async fn test_subscribe_without_ack_fails() {
        let (dbus, _board) = correlator();
        assert!(!dbus.subscribe("firmwareUpdateState").await.unwrap());
        assert!(dbus.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_drop_unregisters_callback() {
        let (session, _board) = console();
        let session = Arc::new(session);
        let dbus = SignalCorrelator::new(session.clone(), SignalCatalog::default(), timeouts());
        let handle = dbus.handle;
        drop(dbus);
        assert!(!session.unregister_callback(handle, None));
    }
}
