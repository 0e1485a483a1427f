//! Plain two-column CSV summary printed at the end of a run.

use crate::aggregate::Summary;
use crate::classify::Outcome;
use std::io::{self, Write};
use tracing::info;

pub fn write_report<W: Write>(summary: &Summary, out: &mut W) -> io::Result<()> {
    writeln!(out, "Total {},{},", summary.unit.plural(), summary.total())?;
    for outcome in Outcome::ALL {
        writeln!(out, "{},{},", outcome.label(), summary.counts.get(outcome))?;
    }
    writeln!(out, "Indeterminate,{},", summary.indeterminate)?;

    if summary.unit.supports_rates() {
        writeln!(out, "FPR,{},", summary.counts.false_positive_rate())?;
        writeln!(out, "Precision,{},", summary.counts.precision())?;
        writeln!(out, "Cx. Frustration Risk,{},", summary.counts.frustration_risk())?;
    } else {
        info!(unit = summary.unit.plural(), "rates are not computed when counting deduplicated networks");
    }

    let endpoints: Vec<String> = summary.fp_endpoints.iter().map(|(ep, n)| format!("{}={}", ep, n)).collect();
    writeln!(out, "FP Domains,{},", endpoints.join(" "))?;
    Ok(())
}

pub fn render(summary: &Summary) -> io::Result<String> {
    let mut buf = Vec::new();
    write_report(summary, &mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
