use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::{ScopeConfig, SessionSettings};
use crate::dialect::{
    Dialect, DialectError, InstrumentDriver, InstrumentIdentity, Screenshot, ScreenshotOptions,
    SourceName,
};
use crate::transport::{Connector, Transport, TransportError};
use crate::waveform::{Waveform, WaveformFormat};

#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error("Oscilloscope {host} is not alive")]
    NotAlive { host: String },

    #[error("Unsupported instrument manufacturer '{manufacturer}'")]
    UnsupportedInstrument { manufacturer: String },

    #[error(transparent)]
    Dialect(#[from] DialectError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ScopeError {
    /// True for I/O timeouts and device side operations that never completed.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ScopeError::Transport(TransportError::Timeout(_))
                | ScopeError::Dialect(
                    DialectError::Timeout { .. }
                        | DialectError::Transport(TransportError::Timeout(_))
                )
        )
    }
}

/// Ordered set of sources; duplicates and absent removals are no-ops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectedSources {
    sources: Vec<SourceName>,
}

impl SelectedSources {
    pub fn add(&mut self, source: SourceName) {
        if !self.contains(&source) {
            self.sources.push(source);
        }
    }

    pub fn remove(&mut self, source: &SourceName) {
        self.sources.retain(|s| s != source);
    }

    pub fn contains(&self, source: &SourceName) -> bool {
        self.sources.contains(source)
    }

    pub fn as_slice(&self) -> &[SourceName] {
        &self.sources
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Transport-level reachability check against `port` on `host`.
///
/// Every failure, including name resolution, counts as not alive.
pub fn probe(host: &str, port: u16, timeout: Duration) -> bool {
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        log::debug!("Could not resolve {}", host);
        return false;
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, timeout).is_ok())
}

/// One configured instrument.
///
/// Capture calls are serialised per instance; the selected sources and the
/// cached identity may be read and toggled from other threads meanwhile.
pub struct Oscilloscope {
    name: String,
    host: String,
    settings: SessionSettings,
    connector: Arc<dyn Connector>,
    identity: Mutex<Option<InstrumentIdentity>>,
    selected: Mutex<SelectedSources>,
    capture: Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Oscilloscope {
    pub fn new(scope: &ScopeConfig, settings: SessionSettings, connector: Arc<dyn Connector>) -> Self {
        Self {
            name: scope.name.clone(),
            host: scope.host.clone(),
            settings,
            connector,
            identity: Mutex::new(None),
            selected: Mutex::new(SelectedSources::default()),
            capture: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn is_alive(&self) -> bool {
        self.is_alive_within(self.settings.probe_timeout)
    }

    pub fn is_alive_within(&self, timeout: Duration) -> bool {
        probe(&self.host, self.settings.probe_port, timeout)
    }

    /// Cached identity, without touching the instrument.
    pub fn cached_identity(&self) -> Option<InstrumentIdentity> {
        lock(&self.identity).clone()
    }

    /// Forget the cached identity so the next call identifies again.
    pub fn invalidate_identity(&self) {
        lock(&self.identity).take();
    }

    /// Identity of the instrument, queried on first use and cached after.
    pub fn identity(&self) -> Result<InstrumentIdentity, ScopeError> {
        if let Some(identity) = self.cached_identity() {
            return Ok(identity);
        }
        if !self.is_alive() {
            return Err(self.not_alive());
        }
        self.with_link(self.settings.command_timeout, |link| self.identify_over(link))
    }

    pub fn add_source(&self, source: SourceName) {
        log::info!("{}: select source {}", self, source);
        lock(&self.selected).add(source);
    }

    pub fn remove_source(&self, source: &SourceName) {
        log::info!("{}: deselect source {}", self, source);
        lock(&self.selected).remove(source);
    }

    pub fn selected_sources(&self) -> Vec<SourceName> {
        lock(&self.selected).as_slice().to_vec()
    }

    /// Sources offered by the instrument, or none if it cannot tell us.
    pub fn list_sources(&self) -> Vec<SourceName> {
        if !self.is_alive() {
            return Vec::new();
        }

        let identity = match self.identity() {
            Ok(identity) => identity,
            Err(e) => {
                log::warn!("{}: cannot identify scope: {}", self, e);
                return Vec::new();
            }
        };
        let Some(dialect) = Dialect::from_manufacturer(&identity.manufacturer) else {
            log::warn!("unsupported scope {}", identity.manufacturer);
            return Vec::new();
        };

        dialect
            .driver(self.settings.timing)
            .list_sources(&identity.model)
            .unwrap_or_else(|e| {
                log::warn!("{}: {}", self, e);
                Vec::new()
            })
    }

    #[tracing::instrument(skip(self), fields(host = %self.host))]
    pub fn take_screenshot(&self, options: ScreenshotOptions) -> Result<Screenshot, ScopeError> {
        if !self.is_alive() {
            return Err(self.not_alive());
        }

        let _capture = lock(&self.capture);
        let identity = self.identity()?;
        let driver = self.driver_for(&identity)?;

        self.with_link(self.settings.capture_timeout, |link| {
            Ok(driver.capture_screenshot(link, &identity.model, &options)?)
        })
    }

    #[tracing::instrument(skip(self), fields(host = %self.host))]
    pub fn take_waveform(&self, format: WaveformFormat) -> Result<Waveform, ScopeError> {
        if !self.is_alive() {
            return Err(self.not_alive());
        }

        let _capture = lock(&self.capture);
        let sources = self.selected_sources();

        self.with_link(self.settings.command_timeout, |link| {
            // the instrument may have been swapped or power cycled since last time
            let identity = self.identify_over(link)?;
            let driver = self.driver_for(&identity)?;

            link.set_io_timeout(self.settings.capture_timeout);
            Ok(driver.capture_waveform(link, &identity.model, &sources, format)?)
        })
    }

    fn not_alive(&self) -> ScopeError {
        ScopeError::NotAlive {
            host: self.host.clone(),
        }
    }

    fn identify_over(&self, link: &mut dyn Transport) -> Result<InstrumentIdentity, ScopeError> {
        // *IDN? is common to all dialects
        let identity = Dialect::Keysight
            .driver(self.settings.timing)
            .identify(link)?;
        *lock(&self.identity) = Some(identity.clone());
        Ok(identity)
    }

    fn driver_for(
        &self,
        identity: &InstrumentIdentity,
    ) -> Result<Box<dyn InstrumentDriver>, ScopeError> {
        match Dialect::from_manufacturer(&identity.manufacturer) {
            Some(dialect) => Ok(dialect.driver(self.settings.timing)),
            None => {
                log::warn!("unsupported scope {}", identity.manufacturer);
                Err(ScopeError::UnsupportedInstrument {
                    manufacturer: identity.manufacturer.clone(),
                })
            }
        }
    }

    /// Open a transport, run `f` on it and close it again whatever happens.
    fn with_link<T>(
        &self,
        io_timeout: Duration,
        f: impl FnOnce(&mut dyn Transport) -> Result<T, ScopeError>,
    ) -> Result<T, ScopeError> {
        let mut link = self.connector.connect(&self.host)?;
        link.set_io_timeout(io_timeout);
        link.open()?;
        let result = f(link.as_mut());
        link.close();
        result
    }
}

impl fmt::Display for Oscilloscope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}: {}]", self.name, self.host)
    }
}

impl fmt::Debug for Oscilloscope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Oscilloscope")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("identity", &self.cached_identity())
            .finish_non_exhaustive()
    }
}
