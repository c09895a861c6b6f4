//! scadbox - sandboxed CAD compiler runner

mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use tracing::Level;

use cli::{Cli, Commands, CompileArgs};
use scadbox::config::{CoordinatorConfig, deadline_from_secs};
use scadbox::image::NativeImageSource;
use scadbox::isolate::{ProcessLauncher, run_worker_main};
use scadbox::logging::{self, LogConfig};
use scadbox::{CompilationResult, Coordinator, OutputFormat, Severity};

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let result = match &cli.command {
        Commands::Compile(args) => {
            logging::init(log_config(&cli).with_env_overrides());
            cmd_compile(&cli, args)
        }
        Commands::Worker(args) => {
            logging::init(LogConfig::for_worker().with_env_overrides());
            run_worker_main(&args.into())
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        // Print the error chain if there are causes
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Map -v/-q to a log level.
fn log_config(cli: &Cli) -> LogConfig {
    let level = if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            _ => Level::DEBUG,
        }
    };
    let config = LogConfig::new().with_level(level);
    if cli.verbose > 0 {
        // Explicit verbosity wins over SCADBOX_LOG/RUST_LOG
        config.with_filter(format!("scadbox={}", level).to_lowercase())
    } else {
        config
    }
}

fn cmd_compile(cli: &Cli, args: &CompileArgs) -> Result<()> {
    let source = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let format = OutputFormat::from(args.format);

    let mut image = NativeImageSource::new(&args.compiler);
    if let Some(dir) = &args.font_dir {
        image = image.with_font_dir(dir);
    }

    let mut config = CoordinatorConfig::default()
        .with_env_overrides()
        .with_default_format(format);
    if let Some(secs) = args.timeout {
        config = config.with_compile_deadline(deadline_from_secs(secs));
    }

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let outcome = rt.block_on(async {
        let coordinator = Coordinator::new(Arc::new(image), Arc::new(ProcessLauncher::new()), config);
        coordinator
            .initialize()
            .await
            .context("Failed to start compiler")?;
        let outcome = coordinator.compile(source)?.await;
        coordinator.shutdown();
        anyhow::Ok(outcome)
    })?;

    match outcome {
        Ok(result) => {
            print_diagnostics(cli, &result);
            let path = args
                .output
                .clone()
                .unwrap_or_else(|| args.file.with_extension(format.extension()));
            if let Some(bytes) = &result.output {
                std::fs::write(&path, bytes)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
            }

            if args.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else if !cli.quiet {
                eprintln!(
                    "{} {} ({} bytes in {:.2}s)",
                    "Wrote".if_supports_color(Stderr, |text| text.green()),
                    path.display(),
                    result.output_len(),
                    result.elapsed.as_secs_f64()
                );
            }
            Ok(())
        }
        Err(e) => {
            if let Some(result) = e.result() {
                print_diagnostics(cli, result);
                if args.json {
                    println!("{}", serde_json::to_string_pretty(result)?);
                }
            }
            Err(e.into())
        }
    }
}

/// Print compiler diagnostics to stderr; info lines only with -v.
fn print_diagnostics(cli: &Cli, result: &CompilationResult) {
    if cli.verbose > 0 {
        for line in &result.info_lines {
            eprintln!("{}", line);
        }
    }
    for diagnostic in &result.diagnostics {
        let label = diagnostic.severity.to_string();
        let label = match diagnostic.severity {
            Severity::Error => label
                .if_supports_color(Stderr, |text| text.red())
                .to_string(),
            Severity::Warning | Severity::Deprecated => label
                .if_supports_color(Stderr, |text| text.yellow())
                .to_string(),
            Severity::Trace => {
                if cli.verbose == 0 {
                    continue;
                }
                label
                    .if_supports_color(Stderr, |text| text.dimmed())
                    .to_string()
            }
        };
        match diagnostic.line {
            Some(line) => eprintln!("{} (line {}): {}", label, line, diagnostic.message),
            None => eprintln!("{}: {}", label, diagnostic.message),
        }
    }
}
