use super::state::TestStatus;
use tokio::sync::broadcast;

/// Test execution events for real-time updates
#[derive(Debug, Clone)]
pub enum TestEvent {
    // Suite events
    SuiteStarted {
        session_id: String,
        case_count: usize,
        dry_run: bool,
    },
    SuiteFinished {
        total: u32,
        passed: u32,
        failed: u32,
        skipped: u32,
        duration_ms: u64,
    },

    // Case events
    CaseStarted {
        case: String,
        step_count: usize,
    },
    CaseFinished {
        case: String,
        status: TestStatus,
        error: Option<String>,
        duration_ms: u64,
    },

    // Step events
    StepStarted {
        case: String,
        index: usize,
        step: String,
    },
    StepPassed {
        case: String,
        index: usize,
        duration_ms: u64,
    },
    StepFailed {
        case: String,
        index: usize,
        error: String,
        duration_ms: u64,
    },
    StepSkipped {
        case: String,
        index: usize,
        reason: String,
    },

    // Log event for coordinated output
    Log {
        message: String,
    },
}

/// Event emitter for broadcasting test events
#[derive(Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<TestEvent>,
}

impl EventEmitter {
    pub fn new() -> (Self, broadcast::Receiver<TestEvent>) {
        let (sender, receiver) = broadcast::channel(100);
        (Self { sender }, receiver)
    }

    pub fn emit(&self, event: TestEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TestEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(100);
        Self { sender }
    }
}

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::time::Duration as StdDuration;

/// Console event listener for printing real-time updates
pub struct ConsoleEventListener;

impl ConsoleEventListener {
    pub async fn listen(mut receiver: broadcast::Receiver<TestEvent>) {
        use colored::Colorize;
        use indicatif::ProgressDrawTarget;
        use std::io::IsTerminal;

        // Hidden target when piped, to avoid terminal escape codes
        let multi = if std::io::stdout().is_terminal() {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };

        // Running step per case: spinner and its label
        let mut spinners: HashMap<String, (ProgressBar, String)> = HashMap::new();

        loop {
            let event = match receiver.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };

            match event {
                TestEvent::SuiteStarted {
                    session_id,
                    case_count,
                    dry_run,
                } => {
                    let mode = if dry_run { " (dry run)" } else { "" };
                    multi
                        .println(format!(
                            "\n{} Test run started: {} ({} cases){}",
                            "▶".green().bold(),
                            session_id.cyan(),
                            case_count,
                            mode.yellow()
                        ))
                        .ok();
                }

                TestEvent::SuiteFinished {
                    total,
                    passed,
                    failed,
                    skipped,
                    duration_ms,
                } => {
                    for (_, (pb, _)) in spinners.drain() {
                        pb.finish();
                    }

                    println!("\n{} Test run finished", "■".blue().bold());
                    println!("  Total cases: {}", total);
                    println!(
                        "  {} passed, {} failed, {} skipped",
                        passed.to_string().green(),
                        failed.to_string().red(),
                        skipped.to_string().yellow()
                    );
                    println!("  Duration: {}ms", duration_ms);
                }

                TestEvent::CaseStarted { case, step_count } => {
                    println!(
                        "\n  {} Test: {} ({} steps)",
                        "→".blue(),
                        case.white().bold(),
                        step_count
                    );
                }

                TestEvent::CaseFinished {
                    case,
                    status,
                    error,
                    duration_ms,
                } => {
                    if let Some((pb, _)) = spinners.remove(&case) {
                        pb.finish_and_clear();
                    }

                    let status_str = match status {
                        TestStatus::Passed => "PASSED".green().bold(),
                        TestStatus::Failed => "FAILED".red().bold(),
                        TestStatus::Skipped => "SKIPPED".yellow().bold(),
                    };
                    println!(
                        "  {} {} [{}] ({}ms)",
                        "←".blue(),
                        case,
                        status_str,
                        duration_ms
                    );
                    if let Some(err) = error {
                        println!("      {}", err.red());
                    }
                }

                TestEvent::StepStarted { case, index, step } => {
                    let pb = multi.add(ProgressBar::new_spinner());
                    if let Ok(style) = ProgressStyle::default_spinner()
                        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
                        .template("    {spinner} {msg}")
                    {
                        pb.set_style(style);
                    }

                    let body = format!("[{}] {}... ", index, step.dimmed());
                    pb.set_message(body.clone());
                    pb.enable_steady_tick(StdDuration::from_millis(100));

                    spinners.insert(case, (pb, body));
                }

                TestEvent::StepPassed {
                    case, duration_ms, ..
                } => {
                    if let Some((pb, body)) = spinners.remove(&case) {
                        pb.finish_and_clear();
                        println!("    {} {}({}ms)", "✓".green(), body, duration_ms);
                    }
                }

                TestEvent::StepFailed {
                    case,
                    error,
                    duration_ms,
                    ..
                } => {
                    if let Some((pb, body)) = spinners.remove(&case) {
                        pb.finish_and_clear();
                        println!("    {} {}({}ms)", "✗".red(), body, duration_ms);
                    }
                    println!("      {}", error.red());
                }

                TestEvent::StepSkipped { index, reason, .. } => {
                    println!("    {} [{}] ({})", "○".yellow(), index, reason.dimmed());
                }

                TestEvent::Log { message } => {
                    multi.println(format!("      {}", message)).ok();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emitter_broadcasts_to_subscribers() {
        let (emitter, mut first) = EventEmitter::new();
        let mut second = emitter.subscribe();

        emitter.emit(TestEvent::Log {
            message: "hello".into(),
        });

        for rx in [&mut first, &mut second] {
            match rx.recv().await.unwrap() {
                TestEvent::Log { message } => assert_eq!(message, "hello"),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn test_emit_without_listeners_is_silent() {
        EventEmitter::default().emit(TestEvent::Log {
            message: "nobody listening".into(),
        });
    }
}
