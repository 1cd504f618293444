use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;

use story_tester::driver::web::{PlaywrightLauncher, WebDriverConfig};
use story_tester::runner::{ConsoleEventListener, EventEmitter, SuiteRunner};
use story_tester::secrets::totp::{current_totp, seconds_remaining};
use story_tester::utils::{HostPolicy, RunConfig};
use story_tester::{parser, report};

/// Exit status when the input could not be parsed
const EXIT_INPUT_ERROR: i32 = 2;

#[derive(Parser)]
#[command(name = "story-tester")]
#[command(version)]
#[command(about = "Run generated user-story test cases against a live web page", long_about = None)]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run test-case file(s) or a directory of them
    Run {
        /// Path to a test-case file or directory
        path: PathBuf,

        /// Base URL that relative `navigate` targets and the login flow start from
        #[arg(long)]
        base_url: Option<String>,

        /// Output directory for results and screenshots
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Validate and echo the cases without opening a browser
        #[arg(long, default_value = "false")]
        dry_run: bool,

        /// Show the browser window
        #[arg(long, default_value = "false")]
        headful: bool,

        /// Maximum number of test cases run at once
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Keep unknown actions (they fail at run time) instead of rejecting the input
        #[arg(long, default_value = "false")]
        lenient: bool,

        /// Extra domain pages may visit besides the base URL's host (repeatable)
        #[arg(long = "allow-host")]
        allow_hosts: Vec<String>,
    },

    /// Print the current one-time code for a base32 secret
    Totp {
        /// Base32 secret
        secret: String,
    },

    /// Render a report from a saved results.json
    Report {
        /// Path to results.json
        results: PathBuf,

        /// Output format (json, junit)
        #[arg(short, long, default_value = "junit")]
        format: String,

        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Run {
            path,
            base_url,
            output,
            dry_run,
            headful,
            jobs,
            lenient,
            allow_hosts,
        } => {
            let mut config = RunConfig::from_env();
            if base_url.is_some() {
                config.base_url = base_url;
            }
            if let Some(output) = output {
                config.output_dir = output;
            }
            if headful {
                config.headless = false;
            }
            if let Some(jobs) = jobs {
                config.max_concurrent_sessions = jobs.max(1);
            }
            config.dry_run = dry_run;
            config.allowed_hosts.extend(allow_hosts);

            println!(
                "{} Running tests from: {}",
                "▶".green().bold(),
                path.display()
            );
            if let Some(ref url) = config.base_url {
                println!("  Base URL: {}", url.cyan());
            }
            println!(
                "  Output: {}",
                config.output_dir.display().to_string().cyan()
            );
            if config.dry_run {
                println!("  Dry run: {}", "Enabled".yellow());
            }
            if config.max_concurrent_sessions > 1 {
                println!(
                    "  Parallel: {} sessions",
                    config.max_concurrent_sessions.to_string().yellow()
                );
            }

            let cases = match parser::load_test_cases(&path, !lenient) {
                Ok(cases) => cases,
                Err(e) => {
                    eprintln!("{} {:#}", "✗".red().bold(), e);
                    std::process::exit(EXIT_INPUT_ERROR);
                }
            };

            let output_dir = config.output_dir.clone();
            let driver_config = WebDriverConfig {
                headless: config.headless,
                host_policy: Some(HostPolicy::from_config(&config)),
                ..WebDriverConfig::default()
            };
            let (events, receiver) = EventEmitter::new();
            let listener = tokio::spawn(ConsoleEventListener::listen(receiver));

            let runner = SuiteRunner::new(Arc::new(PlaywrightLauncher::new(driver_config)), config)
                .with_events(events);
            let summary = runner.run(&cases).await;

            // Closing the last sender lets the listener drain and stop
            drop(runner);
            listener.await.ok();

            match report::write_results(&summary, &output_dir) {
                Ok(paths) => {
                    for path in paths {
                        println!("  Report: {}", path.display());
                    }
                }
                Err(e) => eprintln!("{} Failed to write reports: {:#}", "⚠".yellow(), e),
            }

            std::process::exit(summary.exit_code());
        }

        Commands::Totp { secret } => {
            let now = std::time::SystemTime::now();
            let code = current_totp(&secret, now)?;
            println!("{}", code.green().bold());
            println!("  valid for {}s", seconds_remaining(now));
        }

        Commands::Report {
            results,
            format,
            output,
        } => {
            println!(
                "{} Generating {} report from: {}",
                "📊".to_string().blue(),
                format.cyan(),
                results.display()
            );
            report::generate_report(&results, &format, output.as_deref())?;
        }
    }

    Ok(())
}
