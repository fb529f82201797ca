// Command line front end
//
// This example lists sources, grabs screenshots and waveforms, or watches
// instrument liveness, for a scope given on the command line or in a TOML file.

use clap::{Parser, Subcommand};
use osccap_rs::{
    ImageFormat, LivenessMonitor, OscCapConfig, Oscilloscope, ScopeConfig, ScreenshotOptions,
    SessionSettings, TcpConnector, Waveform, WaveformFormat,
};
use polars::prelude::{CsvWriter, SerWriter};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "osccap")]
#[command(version = "0.1")]
#[command(about = "Capture screenshots and waveforms from networked oscilloscopes")]
struct Args {
    /// TOML configuration with one or more scopes
    #[arg(short, long, conflicts_with = "host")]
    config: Option<PathBuf>,

    /// Host name or address of the instrument
    #[arg(long)]
    host: Option<String>,

    /// Display name used with --host
    #[arg(long, default_value = "scope")]
    name: String,

    /// SCPI socket port
    #[arg(long, default_value_t = osccap_rs::transport::SCPI_SOCKET_PORT)]
    port: u16,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the sources the instrument offers
    Sources,

    /// Save the display as an image
    Screenshot {
        #[arg(short, long, default_value = "screen.png")]
        output: PathBuf,

        #[arg(short, long, default_value = "png")]
        format: String,

        /// Graticule only instead of the full display
        #[arg(long)]
        graticule: bool,
    },

    /// Capture waveforms of the given sources
    Waveform {
        #[arg(required = true)]
        sources: Vec<String>,

        #[arg(short, long, default_value = "waveform.csv")]
        output: PathBuf,

        /// Dump unscaled sample bytes instead of a CSV table
        #[arg(long)]
        binary: bool,
    },

    /// Print liveness events of every configured scope
    Monitor {
        /// Stop after this many events
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let connector = Arc::new(TcpConnector::new(args.port));
    let scopes = match (&args.config, &args.host) {
        (Some(path), _) => {
            let config = OscCapConfig::from_toml_str(&std::fs::read_to_string(path)?)?;
            let mut scopes = config.build_oscilloscopes(connector);
            // the active scope goes first so single-scope commands use it
            if let Some(active) = config.active_scope() {
                scopes.sort_by_key(|s| s.name() != active.name);
            }
            scopes
        }
        (None, Some(host)) => vec![Arc::new(Oscilloscope::new(
            &ScopeConfig {
                name: args.name.clone(),
                host: host.clone(),
            },
            SessionSettings::default(),
            connector,
        ))],
        (None, None) => return Err("either --config or --host is required".into()),
    };
    let Some(scope) = scopes.first().cloned() else {
        return Err("no scopes configured".into());
    };

    match args.command {
        Command::Sources => {
            let sources = scope.list_sources();
            if sources.is_empty() {
                println!("{}: no sources available", scope);
            }
            for source in sources {
                println!("{}", source);
            }
        }
        Command::Screenshot {
            output,
            format,
            graticule,
        } => {
            let options = ScreenshotOptions {
                format: format.parse::<ImageFormat>()?,
                fullscreen: !graticule,
            };
            let screenshot = scope.take_screenshot(options)?;
            std::fs::write(&output, &screenshot.data)?;
            println!(
                "✓ {}: saved {} bytes to {}",
                scope,
                screenshot.data.len(),
                output.display()
            );
        }
        Command::Waveform {
            sources,
            output,
            binary,
        } => {
            for source in sources {
                scope.add_source(source.as_str().into());
            }
            let format = if binary {
                WaveformFormat::Binary
            } else {
                WaveformFormat::Scaled
            };

            match scope.take_waveform(format)? {
                Waveform::Sampled(waveform) => {
                    let mut df = waveform.to_dataframe()?;
                    let mut file = std::fs::File::create(&output)?;
                    CsvWriter::new(&mut file).finish(&mut df)?;
                    println!(
                        "✓ {}: {} points of {} sources to {}",
                        scope,
                        df.height(),
                        waveform.traces.len(),
                        output.display()
                    );
                    if let (Some(first), Some(last)) =
                        (waveform.time.values.first(), waveform.time.values.last())
                    {
                        println!(
                            "   Time: {} to {}",
                            waveform.time.format_time(*first),
                            waveform.time.format_time(*last)
                        );
                    }
                }
                Waveform::Raw(traces) => {
                    for trace in traces {
                        let path = output.with_extension(format!("{}.bin", trace.source));
                        std::fs::write(&path, &trace.data)?;
                        println!("✓ {}: {} bytes to {}", trace.source, trace.data.len(), path.display());
                    }
                }
            }
        }
        Command::Monitor { count } => {
            let (tx, rx) = crossbeam_channel::unbounded();
            let _monitors = scopes
                .iter()
                .map(|scope| LivenessMonitor::start(Arc::clone(scope), tx.clone()))
                .collect::<Result<Vec<_>, _>>()?;
            drop(tx);

            for event in rx.iter().take(count) {
                println!(
                    "{} ({}): {}",
                    event.name,
                    event.host,
                    if event.state.alive { "alive" } else { "dead" }
                );
            }
        }
    }

    Ok(())
}
