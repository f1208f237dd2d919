//! Human-readable terminal output for cycle reports and the backlog.
//!
//! Uses `console` styles: green for work done, yellow for machines skipped,
//! red for failures.

use console::Style;
use serde::Serialize;

use crate::backlog::Backlog;
use crate::dispatcher::CycleReport;
use crate::store::{BrewJob, Order};

pub struct Printer {
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl Default for Printer {
    fn default() -> Self {
        Self {
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }
}

impl Printer {
    pub fn cycle(&self, report: &CycleReport) {
        println!(
            "{}",
            self.dim.apply_to(format!(
                "cycle {} ({} ms, {} machines)",
                report.started_at.format("%Y-%m-%dT%H:%M:%S"),
                report.duration_ms,
                report.endpoints.len()
            ))
        );
        for job in &report.retrieved {
            let suffix = if job.order_ready { ", order ready" } else { "" };
            println!(
                "  {} retrieved {} from {}{suffix}",
                self.green.apply_to("✓"),
                job.job_id,
                job.machine
            );
        }
        for job in &report.dispatched {
            println!(
                "  {} {} sent to {} as {}, ready at {}",
                self.green.apply_to("→"),
                job.product,
                job.machine,
                job.machine_job_id,
                job.ready_at.format("%H:%M:%S")
            );
        }
        for skipped in &report.skipped_machines {
            println!(
                "  {} {} skipped: {}",
                self.yellow.apply_to("…"),
                skipped.machine,
                skipped.reason
            );
        }
        for failure in &report.resolve_failures {
            println!(
                "  {} {} did not resolve: {}",
                self.red.apply_to("✗"),
                failure.address,
                failure.reason
            );
        }
        for failure in &report.failures {
            println!(
                "  {} {} on {} ({:?}): {}",
                self.red.apply_to("✗"),
                failure.job_id,
                failure.machine,
                failure.stage,
                failure.message
            );
        }
        if report.without_ready > 0 {
            println!(
                "  {} {} outstanding job(s) without a ready time",
                self.yellow.apply_to("…"),
                report.without_ready
            );
        }
        if report.released_claims > 0 {
            println!(
                "  {} released {} abandoned claim(s)",
                self.yellow.apply_to("↻"),
                report.released_claims
            );
        }
    }

    pub fn backlog(&self, backlog: &Backlog) {
        println!("{}", self.dim.apply_to("─── Backlog ───"));
        println!("  pending      {}", backlog.pending);
        println!("  claimed      {}", backlog.claimed);
        println!("  brewing      {}", backlog.brewing);
        println!("  due          {}", self.green.apply_to(backlog.due));
        println!("  open orders  {}", backlog.open_orders);
    }

    pub fn order(&self, order: &Order, jobs: &[BrewJob]) {
        println!("{} order {}", self.green.apply_to("✓"), order.id);
        for job in jobs {
            println!("  {} {}", self.dim.apply_to(&job.id), job.product);
        }
    }

    pub fn schema_ready(&self, database_url: &str) {
        println!("{}", self.schema_line(database_url));
    }

    fn schema_line(&self, database_url: &str) -> String {
        format!(
            "{} schema ready at {}",
            self.green.apply_to("✓"),
            redact(database_url)
        )
    }

    /// `--json` output. Nothing else is written to stdout in that mode.
    pub fn json<T: Serialize>(&self, value: &T) -> serde_json::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    pub fn error(&self, message: &str) {
        eprintln!("{} {message}", self.red.apply_to("✗"));
    }
}

/// Hides the password of a database URL.
fn redact(database_url: &str) -> String {
    match url::Url::parse(database_url) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("***"));
            url.to_string()
        }
        _ => database_url.to_string(),
    }
}
