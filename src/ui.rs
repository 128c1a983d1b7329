//! Interface de terminal do cadenza: barra de progresso e relatórios coloridos.
//!
//! Usa as crates `indicatif` para a barra de progresso e `console` para
//! estilização com cores. O [`JobProgress`] é alimentado pelos [`JobEvent`]s
//! emitidos pelo orquestrador.

use std::collections::BTreeMap;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::catalog::ToolCatalog;
use crate::notify::JobEvent;
use crate::resilience::ToolUsage;
use crate::selector::ExecutionPlan;
use crate::state_machine::{JobStatus, JobView};

fn status_style(status: JobStatus) -> Style {
    match status {
        JobStatus::Completed => Style::new().green().bold(),
        JobStatus::Failed => Style::new().red().bold(),
        JobStatus::Cancelled => Style::new().yellow().bold(),
        _ => Style::new().cyan(),
    }
}

/// Progress bar for one running job.
pub struct JobProgress {
    pb: ProgressBar,
    dim: Style,
}

impl JobProgress {
    pub fn start(job_id: &str) -> Self {
        let pb = ProgressBar::new(100);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        pb.set_style(style);
        pb.set_message(format!("job {job_id} queued"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            dim: Style::new().dim(),
        }
    }

    pub fn update(&self, event: &JobEvent) {
        self.pb.set_position(u64::from(event.progress));
        self.pb.set_message(format!(
            "{} {}",
            status_style(event.status).apply_to(event.status),
            event.current_step
        ));
        if event.milestone && !event.is_terminal() {
            self.pb.println(format!(
                "  {} {}% {}",
                self.dim.apply_to("·"),
                event.progress,
                event.current_step
            ));
        }
    }

    /// Clears the bar and prints a one-line outcome.
    pub fn finish(&self, view: &JobView) {
        self.pb.finish_and_clear();
        let style = status_style(view.status);
        match view.status {
            JobStatus::Completed => {
                let quality = view
                    .final_result
                    .as_ref()
                    .map(|r| r.quality_score)
                    .unwrap_or_default();
                println!(
                    "  {} Job completed, quality {quality:.2}",
                    style.apply_to("✓")
                );
            }
            JobStatus::Failed => {
                let reason = view
                    .error
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                println!("  {} Job failed: {reason}", style.apply_to("✗"));
            }
            JobStatus::Cancelled => {
                let reason = view.cancel_reason.as_deref().unwrap_or("cancelled");
                println!("  {} Job cancelled: {reason}", style.apply_to("⊘"));
            }
            other => println!("  {} Job is {other}", style.apply_to("…")),
        }
    }
}

/// Prints the job view as pretty JSON under a coloured header.
pub fn print_report(view: &JobView) {
    println!();
    println!("{}", status_style(view.status).apply_to("─── Job Report ───"));
    println!("{}", serde_json::to_string_pretty(view).unwrap_or_default());
}

pub fn print_usage(usage: &BTreeMap<String, ToolUsage>) {
    if usage.is_empty() {
        return;
    }
    let bold = Style::new().bold();
    println!();
    println!("{}", bold.apply_to("─── Tool Usage ───"));
    for (tool, u) in usage {
        println!(
            "  {tool:<20} calls {:>3}  cost ${:>8.4}  time {:>7.2}s",
            u.count, u.total_cost, u.total_time_secs
        );
    }
}

pub fn print_plan(plan: &ExecutionPlan) {
    let bold = Style::new().bold();
    let dim = Style::new().dim();
    for (i, group) in plan.groups.iter().enumerate() {
        println!("{}", bold.apply_to(format!("Group {}", i + 1)));
        for id in group {
            let Some(task) = plan.task(id) else {
                continue;
            };
            let fallbacks: Vec<&str> = task.fallbacks.iter().map(|f| f.tool.as_str()).collect();
            println!(
                "  {id:<16} {:<20} score {:.3}  ${:.4}  {}",
                task.primary.tool,
                task.primary.score,
                task.primary.estimated_cost,
                dim.apply_to(format!("fallbacks: [{}]", fallbacks.join(", ")))
            );
        }
    }
    println!(
        "{} ${:.4}, ~{:.0}s",
        bold.apply_to("Estimated total:"),
        plan.total_estimated_cost,
        plan.total_estimated_time_secs
    );
}

pub fn print_tools(catalog: &ToolCatalog) {
    let bold = Style::new().bold();
    let dim = Style::new().dim();
    println!("{}", bold.apply_to(format!("{} tools", catalog.len())));
    for tool in catalog.iter() {
        println!(
            "  {:<20} {:<15} reliability {:.2}  {} -> {}",
            tool.name,
            tool.category,
            tool.reliability,
            tool.input_formats.join("|"),
            tool.output_formats.join("|"),
        );
        if !tool.fallbacks.is_empty() {
            println!(
                "  {:<20} {}",
                "",
                dim.apply_to(format!("fallbacks: {}", tool.fallbacks.join(", ")))
            );
        }
    }
}
