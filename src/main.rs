use clap::{Arg, Command};
use log::LevelFilter;
use spamc_milter::diagnostics::{FanoutSink, FileLogSink, LogSink, ProcessLogSink};
use spamc_milter::milter::Milter;
use spamc_milter::pipeline::{Filtered, MessagePipeline};
use spamc_milter::score::ScanResult;
use spamc_milter::ScanSettings;
use std::io::Write;
use std::process;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

#[tokio::main]
async fn main() {
    let matches = Command::new("spamc-milter")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Pipes inbound mail through a spam scanner and flags high scores for discard")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Settings file path")
                .default_value("/etc/spamc-milter.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default settings file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Show effective settings and check the scanner path")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-email")
                .long("test-email")
                .value_name("FILE")
                .help("Filter a message file and print the result")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("filter")
                .long("filter")
                .help("Read a message on stdin and write the filtered message to stdout")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/spamc-milter.yaml");
    let settings = match load_config(config_path) {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        test_config(&settings);
        return;
    }

    let pipeline = MessagePipeline::new(settings.clone(), build_sink(&settings));

    if let Some(email_file) = matches.get_one::<String>("test-email") {
        let message = match std::fs::read(email_file) {
            Ok(message) => message,
            Err(e) => {
                eprintln!("Error reading email file {email_file}: {e}");
                process::exit(1);
            }
        };
        let filtered = pipeline.filter(message).await;
        report(&filtered);
        write_stdout(&filtered.message);
        return;
    }

    if matches.get_flag("filter") {
        let mut message = Vec::new();
        if let Err(e) = tokio::io::stdin().read_to_end(&mut message).await {
            log::error!("Failed to read message from stdin: {e}");
            process::exit(1);
        }
        let filtered = pipeline.filter(message).await;
        write_stdout(&filtered.message);
        return;
    }

    log::info!("Starting spamc milter...");
    let milter = Milter::new(Arc::new(pipeline));
    if let Err(e) = milter.run(&settings.socket_path).await {
        log::error!("Milter error: {e}");
        process::exit(1);
    }
}

fn load_config(path: &str) -> anyhow::Result<ScanSettings> {
    if std::path::Path::new(path).exists() {
        ScanSettings::from_file(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(ScanSettings::default())
    }
}

fn generate_default_config(path: &str) {
    let settings = ScanSettings::default();
    match settings.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn build_sink(settings: &ScanSettings) -> Arc<dyn LogSink> {
    let mut sinks: Vec<Arc<dyn LogSink>> = vec![Arc::new(ProcessLogSink)];
    if let Some(path) = &settings.log_file {
        sinks.push(Arc::new(FileLogSink::new(path)));
    }
    Arc::new(FanoutSink(sinks))
}

fn test_config(settings: &ScanSettings) {
    println!("Scanner path:          {}", settings.scanner_path.display());
    println!("Scanner arguments:     {}", settings.scanner_args);
    println!("Reject threshold:      {}", settings.reject_threshold);
    println!("Max message size:      {}", settings.max_message_size);
    println!("Skip Received headers: {}", settings.skip_received_headers);
    println!("Log level:             {}", settings.log_severity().as_str());
    if let Some(log_file) = &settings.log_file {
        println!("Log file:              {}", log_file.display());
    }
    println!("Scan timeout:          {}s", settings.scan_timeout_secs);
    println!("Milter socket:         {}", settings.socket_path);

    if settings.scanner_exists() {
        println!("Scanner executable found.");
    } else {
        println!(
            "Scanner executable missing: {}",
            settings.scanner_path.display()
        );
        process::exit(1);
    }
}

fn report(filtered: &Filtered) {
    let verdict = match filtered.result {
        _ if filtered.passed_through => "passed through unscanned".to_string(),
        ScanResult::Unscored => "no score found".to_string(),
        ScanResult::Passed { score } => format!("score {score}, accepted"),
        ScanResult::Flagged { score } => format!("score {score}, flagged for discard"),
    };
    eprintln!("Result: {verdict}");
}

fn write_stdout(message: &[u8]) {
    let mut stdout = std::io::stdout().lock();
    if let Err(e) = stdout.write_all(message).and_then(|()| stdout.flush()) {
        log::error!("Failed to write message: {e}");
        process::exit(1);
    }
}
