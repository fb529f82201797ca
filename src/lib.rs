//! # OscCap RS
//!
//! A Rust library for grabbing screenshots and waveforms from networked
//! Tektronix and Keysight oscilloscopes.
//!
//! Instruments are addressed by host name. The library identifies them with
//! `*IDN?`, picks the matching command dialect and returns plain Rust values:
//! PNG bytes for screenshots, scaled samples plus a time axis for waveforms.
//!
//! ## Features
//!
//! - **Dialect detection**: Tektronix TDS/MSO and Keysight Infiniium command sets
//! - **Binary block decoding**: IEEE 488.2 `#<n><len><payload>` responses
//! - **Waveform scaling**: 16 bit samples converted to physical units with a derived time axis
//! - **DataFrame output**: Uses `polars` for waveform export
//! - **Liveness monitoring**: One background thread per instrument, events over a channel
//! - **Pluggable transport**: SCPI over raw TCP out of the box, anything implementing [`Transport`] otherwise
//!
//! ## Examples
//!
//! ### Screenshot
//!
//! ```rust,no_run
//! use osccap_rs::{Oscilloscope, ScopeConfig, ScreenshotOptions, SessionSettings, TcpConnector};
//! use std::sync::Arc;
//!
//! let scope = Oscilloscope::new(
//!     &ScopeConfig { name: "lab".into(), host: "osc05".into() },
//!     SessionSettings::default(),
//!     Arc::new(TcpConnector::default()),
//! );
//!
//! let screenshot = scope.take_screenshot(ScreenshotOptions::default())?;
//! std::fs::write("screen.png", &screenshot.data)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Waveform
//!
//! ```rust,no_run
//! use osccap_rs::{OscCapConfig, TcpConnector, Waveform, WaveformFormat};
//! use std::sync::Arc;
//!
//! let config = OscCapConfig::from_toml_str(r#"
//!     [[scopes]]
//!     name = "lab"
//!     host = "osc05"
//! "#)?;
//! let scopes = config.build_oscilloscopes(Arc::new(TcpConnector::default()));
//! let scope = &scopes[0];
//!
//! scope.add_source("CHANNEL1".into());
//! scope.add_source("CHANNEL2".into());
//! if let Waveform::Sampled(waveform) = scope.take_waveform(WaveformFormat::Scaled)? {
//!     let df = waveform.to_dataframe()?;
//!     println!("Captured {} samples", df.height());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Liveness
//!
//! ```rust,no_run
//! use osccap_rs::{LivenessMonitor, Oscilloscope, ScopeConfig, SessionSettings, TcpConnector};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let scope = Arc::new(Oscilloscope::new(
//!     &ScopeConfig { name: "lab".into(), host: "osc05".into() },
//!     SessionSettings::default(),
//!     Arc::new(TcpConnector::default()),
//! ));
//!
//! let (tx, rx) = crossbeam_channel::unbounded();
//! let _monitor = LivenessMonitor::start(scope, tx)?;
//! for event in rx.iter().take(3) {
//!     println!("{} alive: {}", event.name, event.state.alive);
//! }
//! # Ok(())
//! # }
//! ```

pub mod binary_block;
pub mod config;
pub mod dialect;
pub mod keysight;
pub mod liveness;
pub mod oscilloscope;
pub mod tektronix;
pub mod transport;
pub mod waveform;

#[cfg(test)]
mod mock_transport;

// Re-export the main types for convenience
pub use binary_block::BlockError;

pub use config::{CaptureTiming, ConfigError, OscCapConfig, ScopeConfig, SessionSettings};

pub use dialect::{
    Dialect, DialectError, ImageFormat, InstrumentDriver, InstrumentIdentity, Screenshot,
    ScreenshotOptions, SourceName,
};

pub use liveness::{EmitPolicy, LivenessEvent, LivenessMonitor, LivenessState};

pub use oscilloscope::{Oscilloscope, ScopeError};

pub use transport::{Connector, TcpConnector, TcpTransport, Transport, TransportError};

pub use waveform::{ConversionError, RawTrace, SampledWaveform, TimeAxis, Trace, Waveform, WaveformFormat};
