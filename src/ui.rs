//! Terminal output: a progress bar per source and coloured notices.
//!
//! Uses `indicatif` for the bar and `console` for styling. Notices are
//! printed above the bar so they do not break its redraw.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::ledger::LedgerSummary;
use crate::report::RunReport;
use crate::state_machine::{Candidate, JobOutcome};

const PREVIEW_CHARS: usize = 60;

pub struct RunProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl RunProgress {
    /// Start a bar counting terminal work items out of `total` candidates.
    pub fn start(source: &str, total: u64) -> Self {
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb.set_message(source.to_string());
        pb.enable_steady_tick(Duration::from_millis(120));
        Self::with_bar(pb)
    }

    /// A bar that draws nothing.
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::hidden())
    }

    fn with_bar(pb: ProgressBar) -> Self {
        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    pub fn skipped(&self, count: u64) {
        self.pb.inc(count);
    }

    pub fn submitted(&self, candidate: &Candidate) {
        self.pb
            .set_message(format!("submitted {}", candidate.preview(PREVIEW_CHARS)));
    }

    pub fn repaired(&self, from: &Candidate, to: &Candidate) {
        self.pb.println(format!(
            "  {} {} -> {}",
            self.yellow.apply_to("↻"),
            from.preview(PREVIEW_CHARS),
            to.preview(PREVIEW_CHARS)
        ));
    }

    pub fn finished(&self, candidate: &Candidate, outcome: &JobOutcome) {
        self.pb.inc(1);
        let line = match outcome {
            JobOutcome::Succeeded(metrics) => format!(
                "  {} {} sharpe={} fitness={}",
                self.green.apply_to("✓"),
                candidate.preview(PREVIEW_CHARS),
                fmt_metric(metrics.sharpe),
                fmt_metric(metrics.fitness)
            ),
            JobOutcome::Failed(reason) => format!(
                "  {} {} {reason}",
                self.red.apply_to("✗"),
                candidate.preview(PREVIEW_CHARS)
            ),
        };
        self.pb.println(line);
    }

    /// Clear the bar and print the run report.
    pub fn complete(&self, report: &RunReport) {
        self.pb.finish_and_clear();
        let style = if report.interrupted || !report.unresolved.is_empty() {
            &self.yellow
        } else if report.failed > 0 && report.succeeded == 0 {
            &self.red
        } else {
            &self.green
        };
        println!();
        println!("{}", style.apply_to("─── Run Report ───"));
        println!(
            "{}",
            serde_json::to_string_pretty(report).unwrap_or_default()
        );
    }
}

fn fmt_metric(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.3}"))
}

pub fn print_summary(summary: &LedgerSummary) {
    let title = Style::new().cyan().bold();
    println!("{}", title.apply_to(summary.path.display()));
    println!("  rows:      {}", summary.rows);
    println!("  succeeded: {}", summary.succeeded);
    for (sentinel, count) in &summary.failures {
        println!("  {sentinel}: {count}");
    }
    if let Some(best) = &summary.best {
        println!(
            "  best:      fitness={:.3} sharpe={} {}",
            best.fitness,
            fmt_metric(best.sharpe),
            best.alpha
        );
    }
}
