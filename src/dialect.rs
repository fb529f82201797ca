use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::binary_block::{self, BlockError};
use crate::config::CaptureTiming;
use crate::keysight::Keysight;
use crate::tektronix::Tektronix;
use crate::transport::{Transport, TransportError};
use crate::waveform::{ConversionError, Waveform, WaveformFormat, MAX_RECORD_POINTS};

/// Pseudo source standing for the time axis in source menus.
pub const TIME_SOURCE: &str = "TIME";

/// Instruments answer 9.91E37 for values they cannot provide.
const SCPI_NOT_A_NUMBER: f64 = 9.9e37;

#[derive(Debug, thiserror::Error)]
pub enum DialectError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Block(#[from] BlockError),

    #[error("{0}")]
    Conversion(#[from] ConversionError),

    #[error("Unexpected response to '{command}': '{response}'")]
    Protocol { command: String, response: String },

    #[error("Model {0} is not supported")]
    UnsupportedModel(String),

    #[error("Format {0} is not supported, only png screenshots are available")]
    UnsupportedFormat(String),

    #[error("{operation} did not complete within {waited:?}")]
    Timeout { operation: String, waited: Duration },
}

/// Identifies an acquisition channel, math function or reference memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceName(String);

impl SourceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_time(&self) -> bool {
        self.0 == TIME_SOURCE
    }
}

impl From<&str> for SourceName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentIdentity {
    pub manufacturer: String,
    pub model: String,
}

impl InstrumentIdentity {
    /// Parse an `*IDN?` response: manufacturer, model, serial, firmware.
    pub fn parse(response: &str) -> Result<Self, DialectError> {
        let mut fields = response.trim().split(',').map(str::trim);
        match (fields.next(), fields.next()) {
            (Some(manufacturer), Some(model)) => Ok(Self {
                manufacturer: manufacturer.to_string(),
                model: model.to_string(),
            }),
            _ => Err(DialectError::Protocol {
                command: "*IDN?".to_string(),
                response: response.to_string(),
            }),
        }
    }
}

impl fmt::Display for InstrumentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.manufacturer, self.model)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageFormat {
    #[default]
    Png,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
        }
    }
}

impl FromStr for ImageFormat {
    type Err = DialectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            other => Err(DialectError::UnsupportedFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenshotOptions {
    pub format: ImageFormat,
    /// Whole display instead of the graticule only, where the model can choose.
    pub fullscreen: bool,
}

impl Default for ScreenshotOptions {
    fn default() -> Self {
        Self {
            format: ImageFormat::Png,
            fullscreen: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screenshot {
    pub format: ImageFormat,
    pub data: Vec<u8>,
}

/// Command dialect of an instrument family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Tektronix,
    Keysight,
}

impl Dialect {
    /// Resolve the dialect from the `*IDN?` manufacturer field.
    pub fn from_manufacturer(manufacturer: &str) -> Option<Self> {
        if manufacturer.starts_with("TEKTRONIX") {
            Some(Dialect::Tektronix)
        } else if manufacturer.starts_with("KEYSIGHT") || manufacturer.starts_with("AGILENT") {
            Some(Dialect::Keysight)
        } else {
            None
        }
    }

    pub fn driver(self, timing: CaptureTiming) -> Box<dyn InstrumentDriver> {
        match self {
            Dialect::Tektronix => Box::new(Tektronix::new(timing)),
            Dialect::Keysight => Box::new(Keysight::new()),
        }
    }
}

/// Model specific command sequences of one instrument family.
pub trait InstrumentDriver: Send {
    fn dialect(&self) -> Dialect;

    fn identify(&self, link: &mut dyn Transport) -> Result<InstrumentIdentity, DialectError> {
        let idn = query(link, "*IDN?")?;
        log::info!("IDN: {}", idn);
        InstrumentIdentity::parse(&idn)
    }

    /// Sources the model offers, in menu order.
    fn list_sources(&self, model: &str) -> Result<Vec<SourceName>, DialectError>;

    fn capture_screenshot(
        &self,
        link: &mut dyn Transport,
        model: &str,
        options: &ScreenshotOptions,
    ) -> Result<Screenshot, DialectError>;

    fn capture_waveform(
        &self,
        link: &mut dyn Transport,
        model: &str,
        sources: &[SourceName],
        format: WaveformFormat,
    ) -> Result<Waveform, DialectError>;
}

pub(crate) fn source_table(names: &[&str]) -> Vec<SourceName> {
    names.iter().copied().map(SourceName::from).collect()
}

/// Sources that carry samples, i.e. everything except the time pseudo source.
pub(crate) fn acquired_sources(sources: &[SourceName]) -> impl Iterator<Item = &SourceName> {
    sources.iter().filter(|s| !s.is_time())
}

pub(crate) fn query(link: &mut dyn Transport, command: &str) -> Result<String, DialectError> {
    link.write(command)?;
    Ok(link.read()?.trim().to_string())
}

pub(crate) fn query_parsed<T: FromStr>(
    link: &mut dyn Transport,
    command: &str,
) -> Result<T, DialectError> {
    let response = query(link, command)?;
    response.parse().map_err(|_| DialectError::Protocol {
        command: command.to_string(),
        response,
    })
}

/// Integer query that also accepts NR3 notation such as `1.0E+3`.
///
/// The SCPI "not a number" reply `9.91E37` and counts above
/// [`MAX_RECORD_POINTS`] are protocol errors.
pub(crate) fn query_count(link: &mut dyn Transport, command: &str) -> Result<usize, DialectError> {
    let response = query(link, command)?;
    let count = match response.parse::<usize>() {
        Ok(count) => Some(count),
        Err(_) => match response.parse::<f64>() {
            Ok(value) if (0.0..SCPI_NOT_A_NUMBER).contains(&value) && value.fract() == 0.0 => {
                Some(value as usize)
            }
            _ => None,
        },
    };
    match count {
        Some(count) if count <= MAX_RECORD_POINTS => Ok(count),
        _ => Err(DialectError::Protocol {
            command: command.to_string(),
            response,
        }),
    }
}

pub(crate) fn query_block(link: &mut dyn Transport, command: &str) -> Result<Vec<u8>, DialectError> {
    link.write(command)?;
    let raw = link.read_raw()?;
    Ok(binary_block::decode(&raw)?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_transport::MockTransport;

    #[test]
    fn test_parse_identity() {
        let identity =
            InstrumentIdentity::parse("TEKTRONIX,MSO64,C012345,CF:91.1CT FV:1.0\n").unwrap();
        assert_eq!(identity.manufacturer, "TEKTRONIX");
        assert_eq!(identity.model, "MSO64");
        assert_eq!(identity.to_string(), "TEKTRONIX MSO64");
    }

    #[test]
    fn test_parse_identity_needs_two_fields() {
        assert!(matches!(
            InstrumentIdentity::parse("TEKTRONIX"),
            Err(DialectError::Protocol { .. })
        ));
    }

    #[test]
    fn test_dialect_from_manufacturer() {
        assert_eq!(Dialect::from_manufacturer("TEKTRONIX"), Some(Dialect::Tektronix));
        assert_eq!(
            Dialect::from_manufacturer("KEYSIGHT TECHNOLOGIES"),
            Some(Dialect::Keysight)
        );
        assert_eq!(
            Dialect::from_manufacturer("AGILENT TECHNOLOGIES"),
            Some(Dialect::Keysight)
        );
        assert_eq!(Dialect::from_manufacturer("keysight technologies"), None);
        assert_eq!(Dialect::from_manufacturer("RIGOL TECHNOLOGIES"), None);
    }

    #[test]
    fn test_image_format_from_str() {
        assert_eq!("PNG".parse::<ImageFormat>().unwrap(), ImageFormat::Png);
        assert!(matches!(
            "csv".parse::<ImageFormat>(),
            Err(DialectError::UnsupportedFormat(name)) if name == "csv"
        ));
    }

    #[test]
    fn test_query_count() {
        let mut link = MockTransport::new();
        link.reply("1000").reply("1.0E+3").reply("9.91E37").reply("5E9").reply("-1");

        assert_eq!(query_count(&mut link, "NR_PT?").unwrap(), 1000);
        assert_eq!(query_count(&mut link, "NR_PT?").unwrap(), 1000);
        for _ in 0..3 {
            assert!(matches!(
                query_count(&mut link, "NR_PT?"),
                Err(DialectError::Protocol { .. })
            ));
        }
    }

    #[test]
    fn test_time_source_is_skipped() {
        let sources = source_table(&[TIME_SOURCE, "CH1", "CH2"]);
        let acquired: Vec<&str> = acquired_sources(&sources).map(SourceName::as_str).collect();
        assert_eq!(acquired, vec!["CH1", "CH2"]);
    }
}
