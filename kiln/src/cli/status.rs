// kiln/src/cli/status.rs
use std::collections::HashMap;
use std::time::Instant;

use colored::*;
use kiln_common::pipeline::{PipelineEvent, Stage};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobStatus {
    Waiting,
    Fetching,
    Resolving,
    Preparing,
    Building,
    Testing,
    Linking,
    Success,
    Failed,
}

impl JobStatus {
    /// What a job is doing once it has reached `stage`.
    fn after(stage: Stage) -> Self {
        match stage {
            Stage::Pending => JobStatus::Fetching,
            Stage::SourceAcquired => JobStatus::Resolving,
            Stage::DependenciesResolved => JobStatus::Preparing,
            Stage::Sandboxed => JobStatus::Building,
            Stage::Built => JobStatus::Testing,
            Stage::Tested => JobStatus::Linking,
            Stage::Verified => JobStatus::Success,
        }
    }

    fn display_state(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Fetching => "fetching",
            JobStatus::Resolving => "resolving",
            JobStatus::Preparing => "preparing",
            JobStatus::Building => "building",
            JobStatus::Testing => "testing",
            JobStatus::Linking => "linking",
            JobStatus::Success => "verified",
            JobStatus::Failed => "failed",
        }
    }

    fn slot_indicator(&self) -> String {
        match self {
            JobStatus::Waiting => " ·".dimmed().to_string(),
            JobStatus::Fetching => " ↓".yellow().to_string(),
            JobStatus::Resolving | JobStatus::Preparing => " ⋯".blue().to_string(),
            JobStatus::Building => " ⚙".blue().to_string(),
            JobStatus::Testing => " ?".magenta().to_string(),
            JobStatus::Linking => " →".cyan().to_string(),
            JobStatus::Success => " ✓".green().bold().to_string(),
            JobStatus::Failed => " ✗".red().bold().to_string(),
        }
    }

    fn colored_state(&self) -> ColoredString {
        match self {
            JobStatus::Waiting => self.display_state().dimmed(),
            JobStatus::Fetching => self.display_state().yellow(),
            JobStatus::Resolving | JobStatus::Preparing | JobStatus::Building => {
                self.display_state().blue()
            }
            JobStatus::Testing => self.display_state().magenta(),
            JobStatus::Linking => self.display_state().cyan(),
            JobStatus::Success => self.display_state().green().bold(),
            JobStatus::Failed => self.display_state().red().bold(),
        }
    }
}

struct JobInfo {
    name: String,
    status: JobStatus,
    start_time: Option<Instant>,
    finished_in: Option<f64>,
    pool_id: usize,
}

impl JobInfo {
    fn elapsed_str(&self) -> String {
        match (self.finished_in, self.start_time) {
            (Some(secs), _) => format!("{secs:.1}s"),
            (None, Some(start)) => format!("{:.1}s", start.elapsed().as_secs_f64()),
            (None, None) => "–".to_string(),
        }
    }
}

struct StatusDisplay {
    jobs: HashMap<String, JobInfo>,
    job_order: Vec<String>,
    total_jobs: usize,
    next_pool_id: usize,
    start_time: Instant,
}

impl StatusDisplay {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            job_order: Vec::new(),
            total_jobs: 0,
            next_pool_id: 1,
            start_time: Instant::now(),
        }
    }

    fn add_job(&mut self, target_id: &str, status: JobStatus) {
        if self.jobs.contains_key(target_id) {
            return;
        }
        self.jobs.insert(
            target_id.to_string(),
            JobInfo {
                name: target_id.to_string(),
                status,
                start_time: None,
                finished_in: None,
                pool_id: self.next_pool_id,
            },
        );
        self.job_order.push(target_id.to_string());
        self.next_pool_id += 1;
    }

    /// Records the new status and returns whether it changed.
    fn update_job_status(&mut self, target_id: &str, status: JobStatus) -> bool {
        self.add_job(target_id, JobStatus::Waiting);
        let Some(job) = self.jobs.get_mut(target_id) else {
            return false;
        };
        if job.status == status {
            return false;
        }
        job.status = status;
        if job.start_time.is_none() && status != JobStatus::Waiting {
            job.start_time = Some(Instant::now());
        }
        if matches!(status, JobStatus::Success | JobStatus::Failed) {
            job.finished_in = job.start_time.map(|s| s.elapsed().as_secs_f64());
        }
        true
    }

    fn print_progress_line(&self, target_id: &str) {
        if let Some(job) = self.jobs.get(target_id) {
            println!(
                "{} {:<20} {}",
                "==>".blue().bold(),
                job.name.cyan(),
                job.status.colored_state()
            );
        }
    }

    fn render_table(&self) {
        println!(
            "{:<6} {:<12} {:<20} {:>8} {}",
            "IID".bold().dimmed(),
            "STATE".bold().dimmed(),
            "FORMULA".bold().dimmed(),
            "TIME".bold().dimmed(),
            "SLOT".bold().dimmed()
        );
        for target_id in &self.job_order {
            if let Some(job) = self.jobs.get(target_id) {
                println!(
                    "{:<6} {:<12} {:<20} {:>8} {}",
                    format!("#{:02}", job.pool_id).cyan(),
                    job.status.colored_state(),
                    job.name.cyan(),
                    job.elapsed_str(),
                    job.status.slot_indicator()
                );
            }
        }
        println!("{}", "─".repeat(57).dimmed());
    }
}

/// Prints pipeline progress until the pipeline finishes or the channel closes.
pub async fn handle_events(mut event_rx: broadcast::Receiver<PipelineEvent>) {
    let mut display = StatusDisplay::new();
    let mut logs_buffer = Vec::new();

    loop {
        match event_rx.recv().await {
            Ok(event) => match event {
                PipelineEvent::PlanningStarted => {
                    println!("{}", "Planning operations...".cyan());
                }
                PipelineEvent::PlanningFinished { job_count } => {
                    println!("{} {}", "Planning finished. Jobs:".bold(), job_count);
                }
                PipelineEvent::PipelineStarted { total_jobs } => {
                    display.total_jobs = total_jobs;
                    println!("{}", "Starting pipeline...".cyan().bold());
                }
                PipelineEvent::JobDispatched { target_id } => {
                    display.add_job(&target_id, JobStatus::Waiting);
                }
                PipelineEvent::AttemptStarted { target_id } => {
                    if display.update_job_status(&target_id, JobStatus::Fetching) {
                        display.print_progress_line(&target_id);
                    }
                }
                PipelineEvent::StageReached { target_id, stage } => {
                    // Success is reported by JobSuccess once the job is recorded.
                    let status = JobStatus::after(stage);
                    if status != JobStatus::Success
                        && display.update_job_status(&target_id, status)
                    {
                        display.print_progress_line(&target_id);
                    }
                }
                PipelineEvent::BuildStepStarted {
                    target_id,
                    index,
                    command,
                } => {
                    println!(
                        "    {} step {}: {}",
                        target_id.dimmed(),
                        index,
                        command.dimmed()
                    );
                }
                PipelineEvent::JobSuccess { target_id, version } => {
                    display.update_job_status(&target_id, JobStatus::Success);
                    display.print_progress_line(&target_id);
                    logs_buffer.push(format!(
                        "{}: {} {}",
                        "Installed".green(),
                        target_id.cyan(),
                        version
                    ));
                }
                PipelineEvent::JobFailed {
                    target_id,
                    stage,
                    error,
                } => {
                    display.update_job_status(&target_id, JobStatus::Failed);
                    display.print_progress_line(&target_id);
                    let at = stage.map(|s| format!(" at {s}")).unwrap_or_default();
                    logs_buffer.push(format!(
                        "{} {}{}: {}",
                        "✗".red().bold(),
                        target_id.cyan(),
                        at,
                        error.red()
                    ));
                }
                PipelineEvent::SandboxTornDown { .. } => {}
                PipelineEvent::LogInfo { message } => {
                    logs_buffer.push(message);
                }
                PipelineEvent::LogWarn { message } => {
                    logs_buffer.push(message.yellow().to_string());
                }
                PipelineEvent::LogError { message } => {
                    logs_buffer.push(message.red().to_string());
                }
                PipelineEvent::PipelineFinished {
                    duration_secs,
                    success_count,
                    fail_count,
                } => {
                    if !display.job_order.is_empty() {
                        println!();
                        display.render_table();
                    }
                    println!(
                        "{} in {:.2}s ({} succeeded, {} failed)",
                        "Pipeline finished".bold(),
                        duration_secs,
                        success_count,
                        fail_count
                    );

                    if !logs_buffer.is_empty() {
                        println!();
                        for log in &logs_buffer {
                            println!("{log}");
                        }
                    }

                    let elapsed = display.start_time.elapsed().as_secs_f64();
                    println!(
                        "\n{}: {}  {}: {}  {}: {}  {}: {:.2}s",
                        "Total jobs".bold(),
                        display.total_jobs,
                        "Completed".green().bold(),
                        success_count,
                        "Failed".red().bold(),
                        fail_count,
                        "Elapsed".bold(),
                        elapsed
                    );
                    break;
                }
            },
            Err(broadcast::error::RecvError::Closed) => {
                break;
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {
                // Ignore lag for now
            }
        }
    }
}
