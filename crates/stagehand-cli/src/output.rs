//! Human-readable output

use crate::commands::ColorArg;
use console::{style, Term};
use stagehand::{Mutation, ResolvedPlan, TestOutcome, TestReport};

/// Apply the color choice to both output streams
pub fn configure_colors(color: ColorArg) {
    match color {
        ColorArg::Auto => {}
        ColorArg::Always => {
            console::set_colors_enabled(true);
            console::set_colors_enabled_stderr(true);
        }
        ColorArg::Never => {
            console::set_colors_enabled(false);
            console::set_colors_enabled_stderr(false);
        }
    }
}

/// Writes results to stdout
#[derive(Debug)]
pub struct Printer {
    term: Term,
    quiet: bool,
}

impl Printer {
    /// Printer on stdout
    #[must_use]
    pub fn new(quiet: bool) -> Self {
        Self {
            term: Term::stdout(),
            quiet,
        }
    }

    fn line(&self, text: &str) -> std::io::Result<()> {
        self.term.write_line(text)
    }

    /// Print raw text, even in quiet mode
    pub fn raw(&self, text: &str) -> std::io::Result<()> {
        self.line(text.trim_end_matches('\n'))
    }

    /// Print a resolved plan
    pub fn plan(&self, test: &str, plan: &ResolvedPlan) -> std::io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        self.line(&format!(
            "{} {} ({} mutation(s), {} effective)",
            style("Plan for").bold(),
            style(test).cyan(),
            plan.len(),
            plan.effective_len()
        ))?;
        for (index, mutation) in plan.mutations().iter().enumerate() {
            self.line(&format!("  {:>2}. {}", index + 1, describe(mutation)))?;
        }
        for note in plan.notes() {
            self.line(&format!("  {} {note}", style("note:").yellow()))?;
        }
        Ok(())
    }

    /// Print one rehearsal result
    pub fn rehearsal(&self, report: &TestReport, leaked: &[String]) -> std::io::Result<()> {
        let status = match (&report.outcome, leaked.is_empty()) {
            (TestOutcome::Passed, true) => style("PASS").green().bold(),
            (TestOutcome::Skipped { .. }, true) => style("SKIP").yellow().bold(),
            _ => style("FAIL").red().bold(),
        };
        if self.quiet && report.outcome.is_passed() && leaked.is_empty() {
            return Ok(());
        }
        self.line(&format!(
            "{status} {} ({} attempt(s), {}ms)",
            report.test,
            report.attempts.len(),
            report.duration_ms
        ))?;
        match &report.outcome {
            TestOutcome::Failed { failure } => self.line(&format!("     {failure}"))?,
            TestOutcome::Skipped { reason } => self.line(&format!("     {reason}"))?,
            TestOutcome::Passed => {}
        }
        for diagnostic in &report.diagnostics {
            self.line(&format!(
                "     {} {}",
                style("diagnostic:").yellow(),
                diagnostic.message
            ))?;
        }
        for dimension in leaked {
            self.line(&format!("     {} {dimension}", style("not restored:").red()))?;
        }
        Ok(())
    }

    /// Print a closing tally
    pub fn tally(&self, passed: usize, failed: usize, skipped: usize) -> std::io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        self.line(&format!(
            "\n{} passed, {} failed, {} skipped",
            style(passed).green(),
            style(failed).red(),
            style(skipped).yellow()
        ))
    }
}

fn describe(mutation: &Mutation) -> String {
    let suffix = if mutation.is_planned_noop() {
        format!(" {}", style("(already in place)").dim())
    } else {
        String::new()
    };
    format!("{} = {}{suffix}", mutation.dimension(), mutation.target())
}
