mod configs;
mod identity;
mod lifecycle;
mod list;
mod rotate;

pub use configs::{run_create, run_delete};
pub use identity::run_ip;
pub use lifecycle::{run_start, run_start_all, run_stop, run_stop_all};
pub use list::{run_list, run_running};
pub use rotate::run_rotate;

use crate::output::UserOutput;
use tor_fleet::registry::BatchReport;

/// Print per-client failures of a batch and turn them into the exit status.
fn finish_batch(
    verb: &str,
    report: BatchReport,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    for port in &report.succeeded {
        out.success(&format!("  {} {}", verb, port));
    }
    for (port, err) in &report.failed {
        out.error(&format!("  {} failed: {}", port, err));
        if let Some(hint) = err.suggestion() {
            out.warning(&format!("    Hint: {}", hint));
        }
    }
    if report.succeeded.is_empty() && report.failed.is_empty() {
        out.status("  Nothing to do");
    }
    if report.failed.is_empty() {
        Ok(())
    } else {
        anyhow::bail!(
            "{} of {} clients failed",
            report.failed.len(),
            report.failed.len() + report.succeeded.len()
        )
    }
}
