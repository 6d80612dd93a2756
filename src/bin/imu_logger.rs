// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;

use canonical_error::CanonicalError;
use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry, EnvFilter};
use tracing_appender::non_blocking::NonBlockingBuilder;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use imu_logger::bno08x::Bno08x;
use imu_logger::csv_sink::{CsvSink, default_file_name};
use imu_logger::imu_trait::SampleSource;
use imu_logger::live_display::{LiveDisplay, wait_for_keypress};
use imu_logger::network_sink::{NetworkSink, parse_broker};
use imu_logger::session::{SessionConfig, default_device_id, run_session};
use imu_logger::simulated_imu::SimulatedImu;
use imu_logger::sink_fanout::SinkFanout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Polling interval, milliseconds.
    #[arg(long, default_value = "10")]
    interval_ms: i64,

    /// How often the IMU refreshes its reports, milliseconds. Must not exceed
    /// the polling interval.
    #[arg(long, default_value = "10")]
    report_interval_ms: i64,

    /// Directory for CSV output.
    #[arg(long, default_value = "data")]
    output_dir: String,

    /// CSV file name. Defaults to one derived from the start time.
    #[arg(long)]
    csv_file: Option<String>,

    /// Free-text label written to every CSV row.
    #[arg(long)]
    label: Option<String>,

    /// Identifier written with every reading. Defaults to the host name.
    #[arg(long)]
    device_id: Option<String>,

    /// MQTT broker to publish readings to, host[:port]. If omitted, readings
    /// are not published.
    #[arg(long)]
    broker: Option<String>,

    /// MQTT topic readings are published to.
    #[arg(long, default_value = "imu")]
    topic: String,

    /// Readings that may wait for the broker connection before new ones are
    /// dropped.
    #[arg(long, default_value = "256")]
    queue_capacity: usize,

    /// Show live readings in the terminal. Waits for a key press before
    /// capturing.
    #[arg(long, default_value_t = false)]
    ui: bool,

    /// Use a simulated IMU instead of the BNO08x.
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// I2C bus the BNO08x is attached to.
    #[arg(long, default_value = "1")]
    i2c_bus: u8,

    /// Number of distinct quaternions whose conversions are remembered. Zero
    /// disables this.
    #[arg(long, default_value = "64")]
    memo_capacity: usize,

    /// Stop after this many polls. Runs until control-c if omitted.
    #[arg(long)]
    ticks: Option<u64>,

    /// Directory for log files.
    #[arg(long, default_value = ".")]
    log_dir: String,

    /// Log file name prefix.
    #[arg(long, default_value = "imu_logger_log.txt")]
    log_file: String,
}

fn session_config(args: &Args) -> Result<SessionConfig, CanonicalError> {
    let dev_id = match &args.device_id {
        Some(dev_id) => dev_id.clone(),
        None => default_device_id(),
    };
    let mut config = SessionConfig::new(
        &dev_id, args.interval_ms, args.report_interval_ms)?;
    config.memo_capacity = args.memo_capacity;
    config.queue_capacity = args.queue_capacity;
    config.label = args.label.clone();
    config.max_ticks = args.ticks;
    config.validate()?;
    Ok(config)
}

fn open_source(args: &Args, config: &SessionConfig)
               -> Result<Box<dyn SampleSource + Send>, CanonicalError> {
    if args.simulate {
        info!("Using simulated IMU");
        return Ok(Box::new(SimulatedImu::new(
            &config.dev_id, rand::random(), 30.0, 0)));
    }
    Ok(Box::new(Bno08x::open(args.i2c_bus, &config.dev_id, config.report_interval)?))
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Set up logging. In ui mode the terminal belongs to the display, so log
    // to the file only.
    let file_appender = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&args.log_file)
        .max_log_files(10)
        .build(&args.log_dir)
    {
        Ok(appender) => appender,
        Err(e) => {
            eprintln!("Could not create log file in {}: {:?}", args.log_dir, e);
            return ExitCode::FAILURE;
        },
    };
    let (non_blocking_file, _guard1) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(file_appender);
    let (non_blocking_stdout, _guard2) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stdout());
    let stdout_layer = if args.ui {
        None
    } else {
        Some(fmt::layer().with_writer(non_blocking_stdout))
    };
    registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(stdout_layer)
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking_file))
        .init();

    let config = match session_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e.message);
            return ExitCode::FAILURE;
        },
    };

    // Open the device early; it takes a while to come up after power on.
    let source = match open_source(&args, &config) {
        Ok(source) => source,
        Err(e) => {
            error!("Could not open IMU: {:?}", e);
            return ExitCode::FAILURE;
        },
    };

    let got_signal = Arc::new(AtomicBool::new(false));
    let got_signal2 = got_signal.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Got control-c");
        got_signal2.store(true, AtomicOrdering::Relaxed);
    }) {
        error!("Could not install signal handler: {:?}", e);
        return ExitCode::FAILURE;
    }

    if args.ui {
        if let Err(e) = wait_for_keypress("Press any key to start capturing data") {
            error!("{:?}", e);
            return ExitCode::FAILURE;
        }
    }

    if async_main(args, config, source, got_signal) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

// Returns false if the session could not start or ended with an error.
#[tokio::main]
async fn async_main(args: Args, config: SessionConfig,
                    source: Box<dyn SampleSource + Send>,
                    got_signal: Arc<AtomicBool>) -> bool {
    let mut fanout = SinkFanout::new();

    let csv_file = args.csv_file.clone().unwrap_or_else(
        || default_file_name(&Local::now()));
    let csv_path = PathBuf::from(&args.output_dir).join(csv_file);
    match CsvSink::create(&csv_path, config.label.as_deref()) {
        Ok(sink) => fanout.add_sink(Box::new(sink)),
        Err(e) => {
            error!("Could not create CSV output: {:?}", e);
            return false;
        },
    }

    if let Some(broker) = &args.broker {
        let connected = match parse_broker(broker) {
            Ok((host, port)) => NetworkSink::connect(
                &host, port, &config.dev_id, &args.topic,
                config.queue_capacity, CONNECT_TIMEOUT).await,
            Err(e) => Err(e),
        };
        match connected {
            Ok(sink) => fanout.add_sink(Box::new(sink)),
            Err(e) => warn!("Continuing without network publishing: {}", e.message),
        }
    }

    if args.ui {
        match LiveDisplay::stdout() {
            Ok(display) => fanout.add_sink(Box::new(display)),
            Err(e) => warn!("Continuing without live display: {:?}", e),
        }
    }

    // The acquisition loop blocks, so give it a thread of its own. The
    // network sink's connection task keeps running on the runtime meanwhile.
    let span = tracing::info_span!("session", dev_id = %config.dev_id);
    let result = tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        run_session(&config, source, fanout, &got_signal)
    }).await;

    match result {
        Ok(Ok(summary)) => {
            summary.log();
            summary.error.is_none()
        },
        Ok(Err(e)) => {
            error!("Could not start session: {:?}", e);
            false
        },
        Err(e) => {
            error!("Session thread failed: {:?}", e);
            false
        },
    }
}
