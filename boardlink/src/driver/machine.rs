//! Console mode transitions: bootloader, login prompt and shell.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use regex::Regex;
use tokio::time::Instant;

use super::links::{LinkReadiness, LinkWatch};
use super::state::SessionState;
use crate::channel::{ConsoleSession, PatternSet};
use crate::error::Result;
use crate::platform::{BoardProfile, BootDevice, Timeouts};
use crate::transport::{Link, SerialLink};

/// Moves a board console between bootloader, login prompt and shell.
///
/// The current mode is never cached: every operation first probes the
/// console with the interrupt keystroke and classifies the prompt that
/// answers. Operations report success as a `bool` and log why they failed;
/// timeouts and unexpected prompts are routine on real hardware.
///
/// Operations on one machine are serialised. The machine shares its
/// [`ConsoleSession`] with other consumers, but those should only listen
/// through callbacks while an operation runs.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use boardlink::channel::ConsoleSession;
/// use boardlink::driver::SessionStateMachine;
/// use boardlink::platform::{Credentials, uboot_linux};
/// use boardlink::transport::SerialConfig;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let profile = uboot_linux::profile("imx6-board", Credentials::new("root", "secret"))?;
/// let console = Arc::new(
///     ConsoleSession::open(SerialConfig::new("/dev/ttyUSB0"), profile.prompts.clone()).await?,
/// );
/// let machine = SessionStateMachine::new(console, profile);
///
/// assert!(machine.login(true).await);
/// assert!(machine.reboot().await);
/// # Ok(())
/// # }
/// ```
pub struct SessionStateMachine<L = SerialLink>
where
    L: Link<Frame = Bytes, Outgoing = [u8]>,
{
    console: Arc<ConsoleSession<L>>,
    profile: BoardProfile,
    op: tokio::sync::Mutex<()>,
}

impl<L> SessionStateMachine<L>
where
    L: Link<Frame = Bytes, Outgoing = [u8]>,
{
    /// Create a machine driving `console` with the prompts, commands and
    /// timeouts of `profile`.
    pub fn new(console: Arc<ConsoleSession<L>>, profile: BoardProfile) -> Self {
        Self {
            console,
            profile,
            op: tokio::sync::Mutex::new(()),
        }
    }

    /// The driven console.
    pub fn console(&self) -> &Arc<ConsoleSession<L>> {
        &self.console
    }

    /// The board profile.
    pub fn profile(&self) -> &BoardProfile {
        &self.profile
    }

    fn timeouts(&self) -> &Timeouts {
        &self.profile.timeouts
    }

    /// Log in on the console.
    ///
    /// Succeeds at once if a shell is already open. From the login prompt the
    /// username is sent, then the password if asked for; success means the
    /// shell prompt answered. With `wait_for_network`, a fresh login also
    /// waits for the monitored links, counting reports printed since this
    /// call started. Links staying silent do not fail the login.
    pub async fn login(&self, wait_for_network: bool) -> bool {
        let _op = self.op.lock().await;
        let watch = wait_for_network.then(|| self.watch_links());

        let logged_in = match self.probe(self.timeouts().command_response).await {
            Some(SessionState::AuthenticatedShell) => {
                debug!("already logged in");
                return true;
            }
            Some(SessionState::LoginPrompt) => self.authenticate().await,
            Some(state) => {
                warn!("cannot log in from {}", state);
                return false;
            }
            None => return false,
        };

        if logged_in {
            if let Some(watch) = watch {
                watch.wait(self.timeouts().network_ready).await;
            }
        }
        logged_in
    }

    /// Leave the shell and return to the login prompt.
    pub async fn logout(&self) -> bool {
        let _op = self.op.lock().await;

        match self.probe(self.timeouts().command_response).await {
            Some(SessionState::LoginPrompt) => {
                debug!("already logged out");
                true
            }
            Some(SessionState::AuthenticatedShell) => {
                if !self.send(&self.profile.commands.logout).await {
                    return false;
                }
                let done = self
                    .wait_for(&self.profile.prompts.login, self.timeouts().command_response)
                    .await;
                if !done {
                    warn!("no login prompt after logout");
                }
                done
            }
            Some(state) => {
                warn!("cannot log out from {}", state);
                false
            }
            None => false,
        }
    }

    /// Reboot Linux and wait for the login prompt.
    ///
    /// Logs in first when the console sits at the login prompt.
    pub async fn reboot(&self) -> bool {
        let _op = self.op.lock().await;

        if !self.ensure_shell().await || !self.send(&self.profile.commands.reboot).await {
            return false;
        }
        let done = self
            .wait_for(&self.profile.prompts.login, self.timeouts().reboot)
            .await;
        if done {
            info!("board rebooted to the login prompt");
        } else {
            warn!("no login prompt after reboot");
        }
        done
    }

    /// Reboot into the bootloader and boot Linux from `device`.
    pub async fn reboot_to(&self, device: BootDevice) -> bool {
        let _op = self.op.lock().await;

        self.enter_bootloader(&self.profile.commands.reboot).await
            && self.boot(device, self.timeouts().reboot).await
    }

    /// Restart into the bootloader prompt.
    ///
    /// `reboot_command` is either the Linux reboot command, sent from the
    /// shell (logging in first if needed), or one of the profile's bootloader
    /// restarts such as `reset`, sent from the bootloader prompt. Any other
    /// command is refused. Empty lines are then pushed until the bootloader
    /// prompt answers, stopping the autoboot countdown.
    pub async fn switch_to_bootloader(&self, reboot_command: &str) -> bool {
        let _op = self.op.lock().await;
        self.enter_bootloader(reboot_command).await
    }

    /// Boot Linux from the bootloader prompt and wait for the login prompt.
    pub async fn switch_to_normal_mode(&self) -> bool {
        let _op = self.op.lock().await;

        match self.probe(self.timeouts().command_response).await {
            Some(SessionState::Bootloader) => {
                self.boot(BootDevice::Default, self.timeouts().normal_mode)
                    .await
            }
            Some(state) => {
                warn!("not at the bootloader prompt but at {}", state);
                false
            }
            None => false,
        }
    }

    /// Probe the console until a known prompt answers or `timeout` passes.
    pub async fn where_am_i(&self, timeout: Duration) -> Option<SessionState> {
        let _op = self.op.lock().await;
        let deadline = Instant::now() + timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!("console did not answer with a known prompt");
                return None;
            }
            let window = self.timeouts().where_am_i_probe.min(deadline - now);
            match self.probe(window).await? {
                SessionState::Unknown => continue,
                state => return Some(state),
            }
        }
    }

    /// Wait up to `timeout` for every monitored link to report ready.
    ///
    /// Only reports printed after this call starts are counted.
    pub async fn wait_for_links_ready(&self, timeout: Duration) -> LinkReadiness {
        let _op = self.op.lock().await;
        self.watch_links().wait(timeout).await
    }

    fn watch_links(&self) -> LinkWatch<L> {
        LinkWatch::arm(self.console.clone(), &self.profile.link_ready)
    }

    /// Send the interrupt keystroke and classify the prompt answering it.
    ///
    /// `None` when the keystroke could not be written.
    async fn probe(&self, window: Duration) -> Option<SessionState> {
        self.console.flush().await;
        let interrupt = &self.profile.commands.interrupt;
        if !written(self.console.send_with_eol(interrupt, "").await) {
            return None;
        }

        let prompts = &self.profile.prompts;
        let state = self
            .console
            .receive(window, Some(&prompts.all()))
            .await
            .map_or(SessionState::Unknown, |line| {
                SessionState::classify(&line, prompts)
            });
        debug!("console is at {}", state);
        Some(state)
    }

    /// Answer the login prompt the console is known to show.
    async fn authenticate(&self) -> bool {
        let prompts = &self.profile.prompts;
        let credentials = &self.profile.credentials;
        let timeout = self.timeouts().command_response;

        if !self.send(&credentials.username).await {
            return false;
        }
        let after_username: PatternSet = [prompts.password.clone(), prompts.shell.clone()]
            .into_iter()
            .collect();
        let reply = match self.console.receive(timeout, Some(&after_username)).await {
            Some(line) if prompts.password.is_match(&line) => {
                if !written(self.console.send_hidden(credentials.password()).await) {
                    return false;
                }
                let after_password: PatternSet = [prompts.shell.clone(), prompts.login.clone()]
                    .into_iter()
                    .collect();
                self.console.receive(timeout, Some(&after_password)).await
            }
            other => other,
        };

        match reply {
            Some(line) if prompts.shell.is_match(&line) => {
                info!("logged in as {}", credentials.username);
                true
            }
            Some(_) => {
                warn!("login as {} rejected", credentials.username);
                false
            }
            None => {
                warn!("no shell prompt after logging in as {}", credentials.username);
                false
            }
        }
    }

    async fn ensure_shell(&self) -> bool {
        match self.probe(self.timeouts().command_response).await {
            Some(SessionState::AuthenticatedShell) => true,
            Some(SessionState::LoginPrompt) => self.authenticate().await,
            Some(state) => {
                warn!("no shell available at {}", state);
                false
            }
            None => false,
        }
    }

    async fn enter_bootloader(&self, reboot_command: &str) -> bool {
        let commands = &self.profile.commands;
        let ready = if reboot_command == commands.reboot {
            self.ensure_shell().await
        } else if commands.restarts_bootloader(reboot_command) {
            self.probe(self.timeouts().command_response).await == Some(SessionState::Bootloader)
        } else {
            warn!("'{}' is not a known reboot command", reboot_command);
            return false;
        };
        if !ready {
            warn!("cannot send '{}' from the current console state", reboot_command);
            return false;
        }

        if !self.send(reboot_command).await {
            return false;
        }
        if !self.catch_bootloader().await {
            warn!("bootloader prompt did not appear after '{}'", reboot_command);
            return false;
        }

        tokio::time::sleep(self.timeouts().bootloader_settle).await;
        self.console.flush().await;
        info!("reached the bootloader prompt");
        true
    }

    /// Push empty lines until the bootloader prompt answers.
    async fn catch_bootloader(&self) -> bool {
        let bootloader = PatternSet::from(&self.profile.prompts.bootloader);
        let push = self.timeouts().bootloader_push;
        let deadline = Instant::now() + self.timeouts().bootloader;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if !self.send(&self.profile.commands.probe).await {
                return false;
            }
            let window = push.min(deadline - now);
            if self.console.receive(window, Some(&bootloader)).await.is_some() {
                return true;
            }
        }
    }

    async fn boot(&self, device: BootDevice, timeout: Duration) -> bool {
        if !self.send(self.profile.commands.boot_command(device)).await {
            return false;
        }
        let done = self.wait_for(&self.profile.prompts.login, timeout).await;
        if done {
            info!("board booted to the login prompt");
        } else {
            warn!("no login prompt after booting ({:?})", device);
        }
        done
    }

    async fn send(&self, text: &str) -> bool {
        written(self.console.send(text).await)
    }

    async fn wait_for(&self, prompt: &Regex, timeout: Duration) -> bool {
        self.console
            .receive(timeout, Some(&PatternSet::from(prompt)))
            .await
            .is_some()
    }
}

fn written(result: Result<bool>) -> bool {
    match result {
        Ok(true) => true,
        Ok(false) => {
            warn!("short write to the console");
            false
        }
        Err(e) => {
            warn!("console write failed: {}", e);
            false
        }
    }
}
