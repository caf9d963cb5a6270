//! Builder wiring a serial console, its state machine and D-Bus correlator.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::info;

use super::machine::SessionStateMachine;
use crate::channel::{ConsoleSession, PatternSet};
use crate::dbus::{SignalCatalog, SignalCorrelator};
use crate::error::{ConfigError, Result};
use crate::platform::{BoardProfile, Credentials, Timeouts, uboot_linux};
use crate::transport::{Link, Parity, SerialConfig, SerialLink, StopBits, TransportReader};

/// Builder for a [`Console`].
///
/// # Example
///
/// ```rust,no_run
/// use boardlink::driver::ConsoleBuilder;
///
/// # async fn example() -> Result<(), boardlink::Error> {
/// let console = ConsoleBuilder::new("/dev/ttyUSB0")
///     .hostname("imx6-board")
///     .username("root")
///     .password("secret")
///     .skip(["audit: ", "random: crng"])
///     .build()
///     .await?;
///
/// console.machine().login(true).await;
/// # Ok(())
/// # }
/// ```
pub struct ConsoleBuilder {
    serial: SerialConfig,
    hostname: Option<String>,
    credentials: Credentials,
    custom_profile: Option<BoardProfile>,
    timeouts: Option<Timeouts>,
    catalog: SignalCatalog,
    skip: Vec<String>,
}

impl ConsoleBuilder {
    /// Create a builder for the UART at `port`.
    pub fn new(port: impl Into<String>) -> Self {
        Self::with_serial(SerialConfig::new(port))
    }

    /// Create a builder from a complete serial configuration.
    pub fn with_serial(serial: SerialConfig) -> Self {
        Self {
            serial,
            hostname: None,
            credentials: Credentials::default(),
            custom_profile: None,
            timeouts: None,
            catalog: SignalCatalog::default(),
            skip: Vec::new(),
        }
    }

    /// Set the line rate (default: 115200).
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.serial = self.serial.with_baud_rate(baud_rate);
        self
    }

    /// Set parity and stop bits (default: none, one).
    pub fn framing(mut self, parity: Parity, stop_bits: StopBits) -> Self {
        self.serial = self.serial.with_framing(parity, stop_bits);
        self
    }

    /// Set the inter-character gap and the idle timeout of the reader.
    pub fn read_timeouts(mut self, inter_char: Duration, message: Duration) -> Self {
        self.serial = self.serial.with_timeouts(inter_char, message);
        self
    }

    /// Set the board hostname used by the default U-Boot + Linux profile.
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Set the console username (default: root).
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.credentials.username = username.into();
        self
    }

    /// Set the console password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        let username = std::mem::take(&mut self.credentials.username);
        self.credentials = Credentials::new(username, password);
        self
    }

    /// Use a custom board profile instead of the default one.
    ///
    /// Hostname and credentials set on the builder are ignored.
    pub fn custom_profile(mut self, profile: BoardProfile) -> Self {
        self.custom_profile = Some(profile);
        self
    }

    /// Override the profile's timeouts.
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    /// Set the D-Bus catalog (default: the firmware manager).
    pub fn catalog(mut self, catalog: SignalCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Suppress console lines matching any of `patterns`.
    pub fn skip<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Open the UART and build the console.
    pub async fn build(self) -> Result<Console> {
        let profile = self.profile()?;
        let skip = PatternSet::new(&self.skip).map_err(ConfigError::from)?;
        let transport = TransportReader::open(self.serial.callback_only()).await?;
        Ok(Console::assemble(transport, profile, self.catalog, &skip))
    }

    /// Build the console on an already opened transport.
    ///
    /// The serial settings of the builder are ignored.
    pub fn build_on<L>(self, transport: TransportReader<L>) -> Result<Console<L>>
    where
        L: Link<Frame = Bytes, Outgoing = [u8]>,
    {
        let profile = self.profile()?;
        let skip = PatternSet::new(&self.skip).map_err(ConfigError::from)?;
        Ok(Console::assemble(transport, profile, self.catalog, &skip))
    }

    fn profile(&self) -> Result<BoardProfile> {
        let mut profile = match (&self.custom_profile, &self.hostname) {
            (Some(custom), _) => custom.clone(),
            (None, Some(hostname)) => uboot_linux::profile(hostname, self.credentials.clone())
                .map_err(ConfigError::from)?,
            (None, None) => {
                return Err(ConfigError::InvalidProfile {
                    message: "a hostname or a custom profile is required".to_string(),
                }
                .into());
            }
        };

        if let Some(timeouts) = &self.timeouts {
            profile.timeouts = timeouts.clone();
        }
        Ok(profile)
    }
}

/// A board console with its consumers attached.
///
/// Owns the shared [`ConsoleSession`] and hands it to the
/// [`SessionStateMachine`] and the [`SignalCorrelator`].
pub struct Console<L = SerialLink>
where
    L: Link<Frame = Bytes, Outgoing = [u8]>,
{
    session: Arc<ConsoleSession<L>>,
    machine: SessionStateMachine<L>,
    dbus: SignalCorrelator<L>,
}

impl<L> Console<L>
where
    L: Link<Frame = Bytes, Outgoing = [u8]>,
{
    fn assemble(
        transport: TransportReader<L>,
        profile: BoardProfile,
        catalog: SignalCatalog,
        skip: &PatternSet,
    ) -> Self {
        let endpoint = transport.endpoint();
        let session = Arc::new(ConsoleSession::with_transport(
            transport,
            profile.prompts.clone(),
        ));
        if !skip.is_empty() {
            session.skip_list_add(skip);
        }

        let dbus = SignalCorrelator::new(session.clone(), catalog, profile.timeouts.clone());
        info!("console on {} ready with profile '{}'", endpoint, profile.name);
        let machine = SessionStateMachine::new(session.clone(), profile);

        Self {
            session,
            machine,
            dbus,
        }
    }

    /// The shared line session.
    pub fn session(&self) -> &Arc<ConsoleSession<L>> {
        &self.session
    }

    /// The console mode state machine.
    pub fn machine(&self) -> &SessionStateMachine<L> {
        &self.machine
    }

    /// The D-Bus correlator.
    pub fn dbus(&self) -> &SignalCorrelator<L> {
        &self.dbus
    }

    /// Stop every D-Bus monitor and close the link.
    pub async fn close(self) -> Result<()> {
        let stopped = self.dbus.clear_subscriptions().await;
        self.session.close().await;
        stopped
    }
}
