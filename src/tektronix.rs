use std::thread;
use std::time::Instant;

use crate::binary_block;
use crate::config::CaptureTiming;
use crate::dialect::{
    acquired_sources, query, query_block, query_count, query_parsed, source_table, Dialect,
    DialectError, InstrumentDriver, Screenshot, ScreenshotOptions, SourceName, TIME_SOURCE,
};
use crate::transport::{Transport, TransportError};
use crate::waveform::{
    convert, RawTrace, SampledWaveform, TimeAxis, TimePreamble, Trace, ValuePreamble, Waveform,
    WaveformFormat,
};

const TDS_EXPORT_FILE: &str = r"C:\TEMP\SCREEN.PNG";
const MSO_IMAGE_FILE: &str = "screen.png";

const FOUR_CHANNEL_SOURCES: &[&str] = &[
    TIME_SOURCE, "CH1", "CH2", "CH3", "CH4", "MATH1", "MATH2", "MATH3", "MATH4", "REF1", "REF2",
    "REF3", "REF4",
];

const SIX_CHANNEL_SOURCES: &[&str] = &[
    TIME_SOURCE, "CH1", "CH2", "CH3", "CH4", "CH5", "CH6", "MATH1", "MATH2", "MATH3", "MATH4",
    "REF1", "REF2", "REF3", "REF4",
];

const EIGHT_CHANNEL_SOURCES: &[&str] = &[
    TIME_SOURCE, "CH1", "CH2", "CH3", "CH4", "CH5", "CH6", "CH7", "CH8", "MATH1", "MATH2", "MATH3",
    "MATH4", "REF1", "REF2", "REF3", "REF4",
];

/// How a model gets its display into a file we can read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScreenExport {
    /// TDS series: `EXPORT` to disk, then print the file to the bus.
    Export,
    /// 4/5/6 series MSO: `SAVE:IMAGE` and wait for operation complete.
    SaveImage,
}

#[derive(Debug, Clone, Copy)]
struct ModelInfo {
    export: ScreenExport,
    sources: &'static [&'static str],
}

fn model_info(model: &str) -> Result<ModelInfo, DialectError> {
    let (export, sources) = match model {
        "TDS5104" | "TDS7704" => (ScreenExport::Export, FOUR_CHANNEL_SOURCES),
        "MSO44" | "MSO54" | "MSO64" => (ScreenExport::SaveImage, FOUR_CHANNEL_SOURCES),
        "MSO46" | "MSO56" => (ScreenExport::SaveImage, SIX_CHANNEL_SOURCES),
        "MSO58" => (ScreenExport::SaveImage, EIGHT_CHANNEL_SOURCES),
        other => return Err(DialectError::UnsupportedModel(other.to_string())),
    };
    Ok(ModelInfo { export, sources })
}

pub struct Tektronix {
    timing: CaptureTiming,
}

impl Tektronix {
    pub fn new(timing: CaptureTiming) -> Self {
        Self { timing }
    }

    fn export_screen(
        &self,
        link: &mut dyn Transport,
        options: &ScreenshotOptions,
    ) -> Result<Vec<u8>, DialectError> {
        link.write(&format!("EXPORT:FILENAME \"{}\"", TDS_EXPORT_FILE))?;
        link.write(&format!(
            "EXPORT:FORMAT {}",
            options.format.as_str().to_ascii_uppercase()
        ))?;
        link.write("EXPORT:IMAGE NORMAL")?;
        link.write("EXPORT:PALETTE COLOR")?;
        if options.fullscreen {
            link.write("EXPORT:VIEW FULLSCREEN")?;
        } else {
            link.write("EXPORT:VIEW GRATICULE")?;
            link.write("EXPORT:VIEW FULLNO")?;
        }
        link.write("EXPORT START")?;
        thread::sleep(self.timing.export_settle);

        let print = format!("FILESYSTEM:PRINT \"{}\", GPIB", TDS_EXPORT_FILE);
        let data = link.write(&print).and_then(|()| {
            thread::sleep(self.timing.print_settle);
            link.read_raw()
        });
        Self::delete_after(link, TDS_EXPORT_FILE, data)
    }

    fn save_image(&self, link: &mut dyn Transport) -> Result<Vec<u8>, DialectError> {
        link.write(&format!("SAVE:IMAGE \"{}\"", MSO_IMAGE_FILE))?;
        self.wait_operation_complete(link, "SAVE:IMAGE")?;

        let read_file = format!("FILESYSTEM:READFILE \"{}\"", MSO_IMAGE_FILE);
        let data = link.write(&read_file).and_then(|()| link.read_raw());
        Self::delete_after(link, MSO_IMAGE_FILE, data)
    }

    /// Remove the temporary image from the instrument whether or not the
    /// transfer worked. A failed transfer keeps its own error.
    fn delete_after(
        link: &mut dyn Transport,
        file: &str,
        data: Result<Vec<u8>, TransportError>,
    ) -> Result<Vec<u8>, DialectError> {
        let deleted = link.write(&format!("FILESYSTEM:DELETE \"{}\"", file));
        match (data, deleted) {
            (Ok(data), Ok(())) => Ok(data),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), deleted) => {
                if let Err(delete_error) = deleted {
                    log::warn!("tektronix: could not delete {}: {}", file, delete_error);
                }
                Err(e.into())
            }
        }
    }

    /// Poll `*OPC?` until the instrument reports completion.
    fn wait_operation_complete(
        &self,
        link: &mut dyn Transport,
        operation: &str,
    ) -> Result<(), DialectError> {
        let start = Instant::now();
        while !query(link, "*OPC?")?.contains('1') {
            let waited = start.elapsed();
            if waited > self.timing.opc_max_wait {
                return Err(DialectError::Timeout {
                    operation: operation.to_string(),
                    waited,
                });
            }
            thread::sleep(self.timing.opc_poll_interval);
        }
        log::debug!("tektronix: {} completed after {:?}", operation, start.elapsed());
        Ok(())
    }

    fn time_preamble(link: &mut dyn Transport) -> Result<TimePreamble, DialectError> {
        let points = query_count(link, "WFMOUTPRE:NR_PT?")?;
        let x_increment: f64 = query_parsed(link, "WFMOUTPRE:XINCR?")?;
        let x_origin: f64 = query_parsed(link, "WFMOUTPRE:XZERO?")?;
        log::debug!(
            "tektronix: points={} x_increment={} x_origin={}",
            points,
            x_increment,
            x_origin
        );
        Ok(TimePreamble {
            points,
            x_increment,
            x_origin,
        })
    }

    /// Fold `(raw - YOFF) * YMULT + YZERO` into an increment and an offset.
    fn value_preamble(link: &mut dyn Transport) -> Result<ValuePreamble, DialectError> {
        let y_mult: f64 = query_parsed(link, "WFMOUTPRE:YMULT?")?;
        let y_off: f64 = query_parsed(link, "WFMOUTPRE:YOFF?")?;
        let y_zero: f64 = query_parsed(link, "WFMOUTPRE:YZERO?")?;
        Ok(ValuePreamble {
            y_increment: y_mult,
            y_origin: y_off.mul_add(-y_mult, y_zero),
        })
    }

    /// Signed 16 bit big-endian samples over the whole record.
    fn configure_data(link: &mut dyn Transport) -> Result<(), DialectError> {
        link.write("HEADER OFF")?;
        link.write("DATA:ENCDG RIBINARY")?;
        link.write("WFMOUTPRE:BYT_NR 2")?;
        let record_length = query_count(link, "HORIZONTAL:RECORDLENGTH?")?;
        link.write("DATA:START 1")?;
        link.write(&format!("DATA:STOP {}", record_length))?;
        Ok(())
    }

    fn sampled_waveform(
        link: &mut dyn Transport,
        sources: &[SourceName],
    ) -> Result<SampledWaveform, DialectError> {
        Self::configure_data(link)?;

        let mut acquired = acquired_sources(sources).peekable();
        if let Some(first) = acquired.peek() {
            link.write(&format!("DATA:SOURCE {}", first))?;
        }
        let time = TimeAxis::from_preamble(&Self::time_preamble(link)?)?;

        let mut traces = Vec::new();
        for source in acquired {
            let start = Instant::now();
            link.write(&format!("DATA:SOURCE {}", source))?;
            let scale = Self::value_preamble(link)?;
            let samples = query_block(link, "CURVE?")?;
            let values = convert(&samples, scale.y_increment, scale.y_origin)?;
            log::debug!(
                "tektronix: {} points={} read_time={:?}",
                source,
                values.len(),
                start.elapsed()
            );
            traces.push(Trace {
                source: source.clone(),
                values,
            });
        }

        Ok(SampledWaveform { time, traces })
    }

    fn raw_waveform(
        link: &mut dyn Transport,
        sources: &[SourceName],
    ) -> Result<Vec<RawTrace>, DialectError> {
        Self::configure_data(link)?;
        acquired_sources(sources)
            .map(|source| -> Result<RawTrace, DialectError> {
                link.write(&format!("DATA:SOURCE {}", source))?;
                Ok(RawTrace {
                    source: source.clone(),
                    data: query_block(link, "CURVE?")?,
                })
            })
            .collect()
    }
}

impl InstrumentDriver for Tektronix {
    fn dialect(&self) -> Dialect {
        Dialect::Tektronix
    }

    fn list_sources(&self, model: &str) -> Result<Vec<SourceName>, DialectError> {
        Ok(source_table(model_info(model)?.sources))
    }

    fn capture_screenshot(
        &self,
        link: &mut dyn Transport,
        model: &str,
        options: &ScreenshotOptions,
    ) -> Result<Screenshot, DialectError> {
        log::debug!("tektronix: take_screenshot {}", model);
        let info = model_info(model)?;

        let raw = match info.export {
            ScreenExport::Export => self.export_screen(link, options)?,
            ScreenExport::SaveImage => self.save_image(link)?,
        };

        // file transfers usually arrive unframed, some firmware wraps them in a block
        let data = if binary_block::is_block(&raw) {
            binary_block::decode(&raw)?.to_vec()
        } else {
            raw
        };

        Ok(Screenshot {
            format: options.format,
            data,
        })
    }

    fn capture_waveform(
        &self,
        link: &mut dyn Transport,
        model: &str,
        sources: &[SourceName],
        format: WaveformFormat,
    ) -> Result<Waveform, DialectError> {
        log::debug!(
            "tektronix: take_waveform {} {} sources {:?}",
            model,
            format.as_str(),
            sources
        );
        match format {
            WaveformFormat::Scaled => Ok(Waveform::Sampled(Self::sampled_waveform(link, sources)?)),
            WaveformFormat::Binary => Ok(Waveform::Raw(Self::raw_waveform(link, sources)?)),
        }
    }
}
