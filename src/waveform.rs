use polars::prelude::*;

use crate::dialect::SourceName;

pub const TIME_COLUMN_NAME: &str = "time";

/// Largest record length accepted from an instrument.
pub const MAX_RECORD_POINTS: usize = u32::MAX as usize;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("Sample payload of {len} bytes is not a multiple of 2")]
    InvalidSampleLength { len: usize },

    #[error("No waveform data available (x increment is zero, acquisition not armed?)")]
    NoDataAvailable,

    #[error("Record of {points} points cannot be held in memory")]
    TooManyPoints { points: usize },
}

/// Requested representation of a waveform capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaveformFormat {
    /// 16-bit samples scaled to physical units, with a time axis.
    #[default]
    Scaled,
    /// Raw per-source blocks exactly as the instrument sends them.
    Binary,
}

impl WaveformFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaveformFormat::Scaled => "scaled",
            WaveformFormat::Binary => "binary",
        }
    }
}

/// Convert big-endian signed 16-bit samples to `sample * increment + offset`.
pub fn convert(raw: &[u8], increment: f64, offset: f64) -> Result<Vec<f64>, ConversionError> {
    if raw.len() % 2 != 0 {
        return Err(ConversionError::InvalidSampleLength { len: raw.len() });
    }

    Ok(raw
        .chunks_exact(2)
        .map(|pair| f64::from(i16::from_be_bytes([pair[0], pair[1]])) * increment + offset)
        .collect())
}

/// Time axis description shared by all sources of one acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimePreamble {
    pub points: usize,
    pub x_increment: f64,
    pub x_origin: f64,
}

/// Value axis description of one source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValuePreamble {
    pub y_increment: f64,
    pub y_origin: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeAxis {
    pub values: Vec<f64>,
    /// Number of mantissa digits needed to print a time value without
    /// losing the sampling resolution.
    pub precision: usize,
}

impl TimeAxis {
    /// Build the time axis from a preamble.
    ///
    /// The start time is floored to a multiple of the increment so the origin
    /// sits on the sampling grid.
    pub fn from_preamble(preamble: &TimePreamble) -> Result<Self, ConversionError> {
        let dt = preamble.x_increment;
        if dt == 0.0 {
            return Err(ConversionError::NoDataAvailable);
        }

        let start = (preamble.x_origin / dt).floor() * dt;
        let end = (preamble.points as f64).mul_add(dt, start);

        let points = preamble.points;
        let mut values = Vec::new();
        if points > MAX_RECORD_POINTS || values.try_reserve_exact(points).is_err() {
            return Err(ConversionError::TooManyPoints { points });
        }
        values.extend((0..points).map(|i| (i as f64).mul_add(dt, start)));

        Ok(Self {
            values,
            precision: time_precision(start, end, dt),
        })
    }

    /// Render a time value with the axis precision, e.g. `1.234e-6`.
    pub fn format_time(&self, t: f64) -> String {
        format!("{:.*e}", self.precision, t)
    }
}

/// Digits of mantissa so that the largest time endpoint still resolves `dt`.
fn time_precision(start: f64, end: f64, dt: f64) -> usize {
    let corner = start.abs().max(end.abs());
    let corner_exp = if corner > 0.0 {
        decimal_exponent(corner)
    } else {
        0
    };

    // significant digits of dt's mantissa beyond the leading one
    let dt_repr = format!("{:.6e}", dt.abs());
    let mantissa = dt_repr.split('e').next().unwrap_or("");
    let significant = mantissa.trim_end_matches('0').len() as i64 - 2;

    (corner_exp + significant - decimal_exponent(dt)).max(0) as usize
}

/// Exponent of `x` in scientific notation, taken from its formatted form so
/// exact powers of ten do not round down.
fn decimal_exponent(x: f64) -> i64 {
    format!("{:e}", x.abs())
        .split('e')
        .nth(1)
        .and_then(|exp| exp.parse().ok())
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub source: SourceName,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawTrace {
    pub source: SourceName,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampledWaveform {
    pub time: TimeAxis,
    pub traces: Vec<Trace>,
}

impl SampledWaveform {
    pub fn trace(&self, source: &str) -> Option<&Trace> {
        self.traces.iter().find(|t| t.source.as_str() == source)
    }

    /// Time column followed by one column per source, in capture order.
    ///
    /// Fails if a source returned a different number of points than the
    /// time axis.
    pub fn to_dataframe(&self) -> Result<DataFrame, PolarsError> {
        let mut columns: Vec<Column> = Vec::with_capacity(self.traces.len() + 1);
        columns.push(Column::new(TIME_COLUMN_NAME.into(), self.time.values.clone()));
        for trace in &self.traces {
            columns.push(Column::new(trace.source.as_str().into(), trace.values.clone()));
        }
        DataFrame::new(columns)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Waveform {
    Sampled(SampledWaveform),
    Raw(Vec<RawTrace>),
}

impl Waveform {
    pub fn format(&self) -> WaveformFormat {
        match self {
            Waveform::Sampled(_) => WaveformFormat::Scaled,
            Waveform::Raw(_) => WaveformFormat::Binary,
        }
    }

    pub fn sources(&self) -> Vec<&SourceName> {
        match self {
            Waveform::Sampled(w) => w.traces.iter().map(|t| &t.source).collect(),
            Waveform::Raw(traces) => traces.iter().map(|t| &t.source).collect(),
        }
    }
}
