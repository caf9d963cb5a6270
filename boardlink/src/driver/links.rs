//! Best-effort barrier on network interfaces reporting ready.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use indexmap::IndexMap;
use log::{debug, info};
use regex::Regex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::callback::{CallbackHandle, lock};
use crate::channel::{ConsoleSession, PatternSet};
use crate::transport::Link;

/// Outcome of waiting for network interfaces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkReadiness {
    /// Interfaces that reported ready, in report order.
    pub ready: Vec<String>,

    /// Interfaces still silent when the wait ended.
    pub pending: Vec<String>,
}

impl LinkReadiness {
    /// Check whether every interface reported ready.
    pub fn all_ready(&self) -> bool {
        self.pending.is_empty()
    }
}

struct Barrier {
    pending: Mutex<IndexMap<String, Regex>>,
    ready: Mutex<Vec<String>>,
    notify: Notify,
}

impl Barrier {
    fn on_line(&self, line: &str) {
        let mut pending = lock(&self.pending);
        let Some(index) = pending.values().position(|regex| regex.is_match(line)) else {
            return;
        };
        if let Some((interface, _)) = pending.shift_remove_index(index) {
            debug!("link {} ready", interface);
            lock(&self.ready).push(interface);
        }
        if pending.is_empty() {
            self.notify.notify_one();
        }
    }

    fn is_complete(&self) -> bool {
        lock(&self.pending).is_empty()
    }

    fn report(&self) -> LinkReadiness {
        let pending = lock(&self.pending);
        LinkReadiness {
            ready: lock(&self.ready).clone(),
            pending: pending.keys().cloned().collect(),
        }
    }
}

/// Temporary console callback collecting link-ready lines.
///
/// Armed before the lines can appear and awaited later, so reports printed
/// while other operations read the console are not missed. The callback is
/// removed when the watch is dropped.
pub(crate) struct LinkWatch<L>
where
    L: Link<Frame = Bytes, Outgoing = [u8]>,
{
    console: Arc<ConsoleSession<L>>,
    barrier: Arc<Barrier>,
    handle: CallbackHandle,
}

impl<L> LinkWatch<L>
where
    L: Link<Frame = Bytes, Outgoing = [u8]>,
{
    /// Start watching for every interface in `links`.
    pub(crate) fn arm(console: Arc<ConsoleSession<L>>, links: &IndexMap<String, Regex>) -> Self {
        let barrier = Arc::new(Barrier {
            pending: Mutex::new(links.clone()),
            ready: Mutex::new(Vec::new()),
            notify: Notify::new(),
        });

        let filter: PatternSet = links.values().cloned().collect();
        let sink = barrier.clone();
        let handle = console.register_callback(move |line| sink.on_line(line), filter);

        Self {
            console,
            barrier,
            handle,
        }
    }

    /// Wait until every interface reported ready or `timeout` passes.
    ///
    /// Running out of time is not a failure; the report lists what is still
    /// pending.
    pub(crate) async fn wait(self, timeout: Duration) -> LinkReadiness {
        let deadline = Instant::now() + timeout;

        while !self.barrier.is_complete() {
            if tokio::time::timeout_at(deadline, self.barrier.notify.notified())
                .await
                .is_err()
            {
                break;
            }
        }

        let readiness = self.barrier.report();
        if readiness.all_ready() {
            info!("all links ready: {:?}", readiness.ready);
        } else {
            info!(
                "links ready: {:?}, still pending: {:?}",
                readiness.ready, readiness.pending
            );
        }
        readiness
    }
}

impl<L> Drop for LinkWatch<L>
where
    L: Link<Frame = Bytes, Outgoing = [u8]>,
{
    fn drop(&mut self) {
        self.console.unregister_callback(self.handle, None);
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::test_support::console;

    fn links() -> IndexMap<String, Regex> {
        ["eth0", "wlan0", "usb0"]
            .into_iter()
            .map(|iface| {
                let regex = Regex::new(&format!("{iface}: link becomes ready")).unwrap();
                (iface.to_string(), regex)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_all_links_release_the_barrier() {
        let (session, mut board) = console();
        let session = Arc::new(session);
        let watch = LinkWatch::arm(session.clone(), &links());

        board
            .write_all(
                b"[ 7.1] usb0: link becomes ready\r\n\
                  [ 7.4] eth0: link becomes ready\r\n\
                  [ 9.0] wlan0: link becomes ready\r\n",
            )
            .await
            .unwrap();

        let started = Instant::now();
        let readiness = watch.wait(Duration::from_secs(10)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(readiness.all_ready());
        assert_eq!(readiness.ready, vec!["usb0", "eth0", "wlan0"]);
    }

    #[tokio::test]
    async fn test_timeout_reports_pending_links() {
        let (session, mut board) = console();
        let session = Arc::new(session);
        let watch = LinkWatch::arm(session.clone(), &links());

        board
            .write_all(b"[ 7.4] eth0: link becomes ready\r\n")
            .await
            .unwrap();

        let readiness = watch.wait(Duration::from_millis(300)).await;
        assert_eq!(readiness.ready, vec!["eth0"]);
        assert_eq!(readiness.pending, vec!["wlan0", "usb0"]);
        assert!(!readiness.all_ready());
    }

    #[tokio::test]
    async fn test_lines_before_wait_are_counted() {
        let (session, mut board) = console();
        let session = Arc::new(session);
        let mut only_eth = links();
        only_eth.retain(|iface, _| iface == "eth0");
        let watch = LinkWatch::arm(session.clone(), &only_eth);

        board
            .write_all(b"[ 7.4] eth0: link becomes ready\r\n")
            .await
            .unwrap();
        assert!(session.receive(Duration::from_secs(2), None).await.is_some());

        let readiness = watch.wait(Duration::from_millis(100)).await;
        assert!(readiness.all_ready());
    }

    #[tokio::test]
    async fn test_no_links_is_ready_immediately() {
        let (session, _board) = console();
        let watch = LinkWatch::arm(Arc::new(session), &IndexMap::new());
        assert_eq!(watch.wait(Duration::from_secs(5)).await, LinkReadiness::default());
    }

    #[tokio::test]
    async fn test_drop_removes_callback() {
        let (session, _board) = console();
        let session = Arc::new(session);
        let watch = LinkWatch::arm(session.clone(), &links());
        let handle = watch.handle;
        drop(watch);
        assert!(!session.unregister_callback(handle, None));
    }
}
