//! Final report rendering on stdout; logs go to stderr.

use anyhow::Result;
use appcheck_common::checks::CheckReport;
use appcheck_common::{HarnessError, RunReport};
use serde_json::json;

pub fn print_run(run: &RunReport<CheckReport>, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(run)?);
        return Ok(());
    }
    let duration = (run.finished_at - run.started_at)
        .to_std()
        .unwrap_or_default();
    println!(
        "ready after {} attempt(s) in {}ms, {} log line(s), finished in {}",
        run.readiness.attempts,
        run.readiness.elapsed.as_millis(),
        run.log_lines,
        humantime_millis(duration),
    );
    let states: Vec<String> = run.history.iter().map(|t| t.state.to_string()).collect();
    println!("states: {}", states.join(" -> "));
    print_outcomes(&run.output);
    Ok(())
}

pub fn print_checks(checks: &CheckReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(checks)?);
    } else {
        print_outcomes(checks);
    }
    Ok(())
}

pub fn print_error(err: &anyhow::Error, json: bool) {
    let phase = err
        .downcast_ref::<HarnessError>()
        .map(|e| e.phase().to_string());
    if json {
        println!(
            "{}",
            json!({
                "error": format!("{err:#}"),
                "phase": phase,
            })
        );
    } else {
        match phase {
            Some(phase) => eprintln!("appcheck: {phase} failed: {err:#}"),
            None => eprintln!("appcheck: {err:#}"),
        }
    }
}

fn print_outcomes(checks: &CheckReport) {
    let width = checks
        .outcomes
        .iter()
        .map(|o| o.name.len())
        .max()
        .unwrap_or(0);
    for outcome in &checks.outcomes {
        let mark = if outcome.passed { "ok  " } else { "FAIL" };
        println!(
            "  {mark} {:width$}  {} ({}ms)",
            outcome.name, outcome.detail, outcome.duration_ms
        );
    }
    let failed = checks.failures().count();
    println!("{} check(s), {failed} failed", checks.outcomes.len());
}

fn humantime_millis(duration: std::time::Duration) -> humantime::FormattedDuration {
    humantime::format_duration(std::time::Duration::from_millis(
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
    ))
}
