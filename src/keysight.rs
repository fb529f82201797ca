use std::time::Instant;

use crate::dialect::{
    acquired_sources, query_block, query_count, query_parsed, source_table, Dialect, DialectError,
    InstrumentDriver, Screenshot, ScreenshotOptions, SourceName,
};
use crate::transport::Transport;
use crate::waveform::{
    convert, RawTrace, SampledWaveform, TimeAxis, TimePreamble, Trace, ValuePreamble, Waveform,
    WaveformFormat,
};

const INFINIIUM_SOURCES: &[&str] = &[
    "CHANNEL1", "CHANNEL2", "CHANNEL3", "CHANNEL4", "FUNCTION1", "FUNCTION2", "FUNCTION3",
    "FUNCTION4", "FUNCTION5", "FUNCTION6", "FUNCTION7", "FUNCTION8", "FUNCTION9", "FUNCTION10",
    "FUNCTION11", "FUNCTION12", "FUNCTION13", "FUNCTION14", "FUNCTION15", "FUNCTION16", "WMEMORY1",
    "WMEMORY2", "WMEMORY3", "WMEMORY4",
];

fn model_sources(model: &str) -> Result<&'static [&'static str], DialectError> {
    match model {
        "DSOX91604A" => Ok(INFINIIUM_SOURCES),
        other => Err(DialectError::UnsupportedModel(other.to_string())),
    }
}

/// Keysight (formerly Agilent) Infiniium oscilloscopes.
#[derive(Debug, Default)]
pub struct Keysight;

impl Keysight {
    pub fn new() -> Self {
        Self
    }

    fn time_preamble(link: &mut dyn Transport) -> Result<TimePreamble, DialectError> {
        let points = query_count(link, ":WAVEFORM:POINTS?")?;
        let x_increment: f64 = query_parsed(link, ":WAVEFORM:XINCREMENT?")?;
        let x_origin: f64 = query_parsed(link, ":WAVEFORM:XORIGIN?")?;
        log::debug!(
            "keysight: points={} x_increment={} x_origin={}",
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

    fn read_source(link: &mut dyn Transport, source: &SourceName) -> Result<Trace, DialectError> {
        let points = query_count(link, ":ACQUIRE:POINTS?")?;

        link.write(&format!(":WAVEFORM:SOURCE {}", source))?;
        let start = Instant::now();
        link.write(":WAVEFORM:BYTEORDER MSBFIRST")?;

        let scale = ValuePreamble {
            y_increment: query_parsed(link, ":WAVEFORM:YINCREMENT?")?,
            y_origin: query_parsed(link, ":WAVEFORM:YORIGIN?")?,
        };
        log::debug!(
            "keysight: {} points={} increment={} offset={}",
            source,
            points,
            scale.y_increment,
            scale.y_origin
        );

        let samples = query_block(link, ":WAVEFORM:DATA?")?;
        let values = convert(&samples, scale.y_increment, scale.y_origin)?;
        log::debug!("keysight: {} read_time={:?}", source, start.elapsed());

        Ok(Trace {
            source: source.clone(),
            values,
        })
    }

    fn sampled_waveform(
        link: &mut dyn Transport,
        sources: &[SourceName],
    ) -> Result<SampledWaveform, DialectError> {
        // plain numbers, no command headers in responses
        link.write(":SYSTEM:HEADER 0")?;
        link.write(":WAVEFORM:FORMAT WORD")?;

        let mut acquired = acquired_sources(sources).peekable();
        if let Some(first) = acquired.peek() {
            link.write(&format!(":WAVEFORM:SOURCE {}", first))?;
        }
        let time = TimeAxis::from_preamble(&Self::time_preamble(link)?)?;

        let traces = acquired
            .map(|source| Self::read_source(link, source))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SampledWaveform { time, traces })
    }

    fn raw_waveform(
        link: &mut dyn Transport,
        sources: &[SourceName],
    ) -> Result<Vec<RawTrace>, DialectError> {
        link.write(":WAVEFORM:FORMAT BINARY")?;

        let mut traces = Vec::new();
        for source in acquired_sources(sources) {
            link.write(&format!(":WAVEFORM:SOURCE {}", source))?;
            traces.push(RawTrace {
                source: source.clone(),
                data: query_block(link, ":WAVEFORM:DATA?")?,
            });
        }
        Ok(traces)
    }
}

impl InstrumentDriver for Keysight {
    fn dialect(&self) -> Dialect {
        Dialect::Keysight
    }

    fn list_sources(&self, model: &str) -> Result<Vec<SourceName>, DialectError> {
        Ok(source_table(model_sources(model)?))
    }

    fn capture_screenshot(
        &self,
        link: &mut dyn Transport,
        model: &str,
        options: &ScreenshotOptions,
    ) -> Result<Screenshot, DialectError> {
        log::debug!("keysight: take_screenshot {}", model);
        model_sources(model)?;

        let command = format!(
            ":DISPLAY:DATA? {}",
            options.format.as_str().to_ascii_uppercase()
        );
        let data = query_block(link, &command).inspect_err(|e| {
            log::error!("keysight: error taking screenshot: {}", e);
        })?;

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
            "keysight: take_waveform {} {} sources {:?}",
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_transport::MockTransport;
    use crate::waveform::ConversionError;

    fn sources(names: &[&str]) -> Vec<SourceName> {
        source_table(names)
    }

    #[test]
    fn test_list_sources() {
        let sources = Keysight::new().list_sources("DSOX91604A").unwrap();
        assert_eq!(sources.len(), 24);
        assert_eq!(sources[0].as_str(), "CHANNEL1");
        assert_eq!(sources[23].as_str(), "WMEMORY4");
        assert!(matches!(
            Keysight::new().list_sources("MSOX3034T"),
            Err(DialectError::UnsupportedModel(_))
        ));
    }

    #[test]
    fn test_screenshot_decodes_block() {
        let mut link = MockTransport::new();
        link.reply(b"#18\x89PNG\r\n\x1a\n\n");

        let screenshot = Keysight::new()
            .capture_screenshot(&mut link, "DSOX91604A", &ScreenshotOptions::default())
            .unwrap();
        assert_eq!(screenshot.data, b"\x89PNG\r\n\x1a\n");
        assert_eq!(link.writes(), vec![":DISPLAY:DATA? PNG"]);
    }

    #[test]
    fn test_screenshot_malformed_block() {
        let mut link = MockTransport::new();
        link.reply(b"#19\x89PNG\n");

        let result = Keysight::new().capture_screenshot(
            &mut link,
            "DSOX91604A",
            &ScreenshotOptions::default(),
        );
        assert!(matches!(result, Err(DialectError::Block(_))));
    }

    #[test]
    fn test_scaled_waveform_one_source() {
        let mut link = MockTransport::new();
        link.reply("2") // :WAVEFORM:POINTS?
            .reply("1E-6")
            .reply("-2.5E-6")
            .reply("2") // :ACQUIRE:POINTS?
            .reply("0.5")
            .reply("100")
            .reply(b"#14\x01\x00\x02\x00\n");

        let waveform = Keysight::new()
            .capture_waveform(
                &mut link,
                "DSOX91604A",
                &sources(&["CHANNEL1"]),
                WaveformFormat::Scaled,
            )
            .unwrap();

        let Waveform::Sampled(waveform) = waveform else {
            panic!("expected sampled waveform");
        };
        assert_eq!(waveform.traces.len(), 1);
        assert_eq!(waveform.traces[0].values, vec![228.0, 356.0]);
        assert_eq!(waveform.time.values.len(), 2);
        assert!((waveform.time.values[0] + 3e-6).abs() < 1e-15);

        let writes = link.writes();
        assert_eq!(writes[0], ":SYSTEM:HEADER 0");
        assert_eq!(writes[1], ":WAVEFORM:FORMAT WORD");
        assert!(writes.contains(&":WAVEFORM:BYTEORDER MSBFIRST".to_string()));
        assert_eq!(writes.last().unwrap(), ":WAVEFORM:DATA?");
    }

    #[test]
    fn test_zero_increment_stops_before_samples() {
        let mut link = MockTransport::new();
        link.reply("2").reply("0").reply("0");

        let result = Keysight::new().capture_waveform(
            &mut link,
            "DSOX91604A",
            &sources(&["CHANNEL1"]),
            WaveformFormat::Scaled,
        );
        assert!(matches!(
            result,
            Err(DialectError::Conversion(ConversionError::NoDataAvailable))
        ));
        assert!(!link.writes().contains(&":WAVEFORM:DATA?".to_string()));
    }

    #[test]
    fn test_not_a_number_point_count() {
        let mut link = MockTransport::new();
        link.reply("9.91E37").reply("1E-6").reply("0");

        let result = Keysight::new().capture_waveform(
            &mut link,
            "DSOX91604A",
            &sources(&["CHANNEL1"]),
            WaveformFormat::Scaled,
        );
        assert!(matches!(
            result,
            Err(DialectError::Protocol { command, response })
                if command == ":WAVEFORM:POINTS?" && response == "9.91E37"
        ));
        assert!(!link.writes().contains(&":WAVEFORM:DATA?".to_string()));
    }

    #[test]
    fn test_odd_sample_payload() {
        let mut link = MockTransport::new();
        link.reply("1")
            .reply("1E-6")
            .reply("0")
            .reply("1")
            .reply("1")
            .reply("0")
            .reply(b"#13\x01\x00\x02\n");

        let result = Keysight::new().capture_waveform(
            &mut link,
            "DSOX91604A",
            &sources(&["CHANNEL1"]),
            WaveformFormat::Scaled,
        );
        assert!(matches!(
            result,
            Err(DialectError::Conversion(ConversionError::InvalidSampleLength { len: 3 }))
        ));
    }

    #[test]
    fn test_binary_waveform_skips_time() {
        let mut link = MockTransport::new();
        link.reply(b"#14\x00\x01\x00\x02\n");

        let waveform = Keysight::new()
            .capture_waveform(
                &mut link,
                "DSOX91604A",
                &sources(&["TIME", "CHANNEL2"]),
                WaveformFormat::Binary,
            )
            .unwrap();
        assert_eq!(
            waveform,
            Waveform::Raw(vec![RawTrace {
                source: SourceName::from("CHANNEL2"),
                data: vec![0, 1, 0, 2],
            }])
        );
        assert_eq!(
            link.writes(),
            vec![
                ":WAVEFORM:FORMAT BINARY",
                ":WAVEFORM:SOURCE CHANNEL2",
                ":WAVEFORM:DATA?"
            ]
        );
    }
}
