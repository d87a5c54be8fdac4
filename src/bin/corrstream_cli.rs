use clap::{Parser, Subcommand};
use corrstream::{load_processor, ProcessorConfig, Record};
use log::{info, warn};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};

#[derive(Parser)]
#[command(name = "corrstream-cli")]
#[command(about = "Correlate a stream of JSON log records into aggregated windows")]
#[command(version)]
struct Cli {
    /// Processor configuration file (YAML or JSON)
    #[arg(short, long, global = true, default_value = "corrstream.yaml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the processor over a JSONL record stream
    Run {
        /// Input path, '-' reads stdin
        #[arg(short, long, default_value = "-")]
        input: String,

        /// Close every window still open at end of input and emit its
        /// summary, overriding the configured shutdown policy
        #[arg(long)]
        flush: bool,
    },
    /// Validate the configuration and exit
    Check,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { input, flush } => run(&cli.config, &input, flush),
        Commands::Check => check(&cli.config),
    }
}

fn run(config: &str, input: &str, flush: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut processor = load_processor(config)?;
    info!("starting {}", processor.instance_name());

    let reader: Box<dyn BufRead> = if input == "-" {
        Box::new(io::stdin().lock())
    } else {
        let file =
            File::open(input).map_err(|e| format!("cannot open input '{}': {}", input, e))?;
        Box::new(BufReader::new(file))
    };
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    let mut records_in = 0u64;
    let mut records_out = 0u64;
    let mut skipped = 0u64;

    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: serde_json::Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(e) => {
                warn!("skipping malformed JSON line: {}", e);
                skipped += 1;
                continue;
            }
        };
        let Some(record) = Record::from_json(&value) else {
            warn!("skipping non-object JSON line");
            skipped += 1;
            continue;
        };
        records_in += 1;
        let outcome = processor.process(record)?;
        for outgoing in outcome.into_records() {
            records_out += 1;
            writeln!(out, "{}", outgoing.as_record().to_json())?;
        }
    }

    let tail = if flush {
        processor.flush()
    } else {
        processor.shutdown()
    };
    for summary in tail {
        records_out += 1;
        writeln!(out, "{}", summary.as_record().to_json())?;
    }
    out.flush()?;

    info!(
        "done: {} record(s) in, {} out, {} skipped",
        records_in, records_out, skipped
    );
    Ok(())
}

fn check(config: &str) -> Result<(), Box<dyn std::error::Error>> {
    let parsed = ProcessorConfig::from_file(config)?;
    let processor = parsed.build()?;
    println!("configuration OK: {}", processor.instance_name());
    Ok(())
}
