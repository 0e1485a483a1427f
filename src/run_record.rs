//! Verifier batch-run records, as emitted by the batch-run tool in JSON, and their
//! flattening to CSV.

use crate::fields;
use crate::verifier_log;
use crate::AuditError;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsdctlVersion {
    /// Ships verifier v0.4.11.
    V0_34,
    /// Ships verifier v1.0.0.
    V0_35,
}

impl OsdctlVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            OsdctlVersion::V0_34 => "0.34",
            OsdctlVersion::V0_35 => "0.35",
        }
    }

    pub fn verifier_version(self) -> &'static str {
        match self {
            OsdctlVersion::V0_34 => "0.4.11",
            OsdctlVersion::V0_35 => "1.0.0",
        }
    }
}

impl FromStr for OsdctlVersion {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "0.34" => Ok(OsdctlVersion::V0_34),
            "0.35" => Ok(OsdctlVersion::V0_35),
            other => Err(AuditError::malformed(format!("unknown osdctl_version {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Curl,
    Legacy,
}

impl FromStr for Probe {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "curl" => Ok(Probe::Curl),
            "legacy" => Ok(Probe::Legacy),
            other => Err(AuditError::malformed(format!("unknown probe {:?}", other))),
        }
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Probe::Curl => "curl",
            Probe::Legacy => "legacy",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArch {
    X86,
    Arm,
}

impl FromStr for CpuArch {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "x86" => Ok(CpuArch::X86),
            "arm" => Ok(CpuArch::Arm),
            other => Err(AuditError::malformed(format!("unknown arch {:?}", other))),
        }
    }
}

impl fmt::Display for CpuArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CpuArch::X86 => "x86",
            CpuArch::Arm => "arm",
        })
    }
}

/// One run of the verifier against one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub duration: Duration,
    pub cid: String,
    pub osdctl_version: OsdctlVersion,
    pub probe: Probe,
    pub arch: CpuArch,
    pub logpath: String,
    pub output: String,
}

fn string_field<'a>(object: &'a Map<String, Value>, key: &str) -> Result<&'a str, AuditError> {
    match object.get(key) {
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(other) => Err(AuditError::malformed(format!("{} must be a string, got {}", key, other))),
        None => Err(AuditError::malformed(format!("missing {}", key))),
    }
}

// Batch-run output has carried durations both as numbers and as numeric strings.
fn duration_field(object: &Map<String, Value>) -> Result<Duration, AuditError> {
    let secs = match object.get("duration") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    secs.map(Duration::from_secs)
        .ok_or_else(|| AuditError::malformed("duration must be a whole number of seconds"))
}

impl RunRecord {
    pub fn from_object(object: &Map<String, Value>) -> Result<Self, AuditError> {
        let duration = duration_field(object)?;
        let cid = fields::non_nully(Some(string_field(object, "cid")?))
            .ok_or_else(|| AuditError::malformed("missing cluster id (cid)"))?
            .to_string();
        let output = fields::non_nully(Some(string_field(object, "output")?))
            .ok_or_else(|| AuditError::malformed("missing output log"))?
            .to_string();

        Ok(RunRecord {
            duration,
            cid,
            osdctl_version: string_field(object, "osdctl_version")?.parse()?,
            probe: string_field(object, "probe")?.parse()?,
            arch: string_field(object, "arch")?.parse()?,
            logpath: string_field(object, "logpath")?.trim().to_string(),
            output,
        })
    }

    pub fn errors(&self) -> BTreeSet<String> {
        verifier_log::errors(&self.output)
    }

    pub fn egress_failures(&self) -> BTreeSet<String> {
        verifier_log::egress_failures(&self.output)
    }
}

/// Reads a JSON document holding one run or an array of runs. Invalid runs are logged
/// and skipped.
pub fn parse_runs(value: &Value) -> Result<Vec<RunRecord>, AuditError> {
    let objects: Vec<&Value> = match value {
        Value::Object(_) => vec![value],
        Value::Array(items) => items.iter().collect(),
        _ => return Err(AuditError::Other("JSON is not an object or an array of objects".to_string())),
    };

    let mut runs = Vec::with_capacity(objects.len());
    for (index, item) in objects.into_iter().enumerate() {
        let parsed = match item {
            Value::Object(object) => RunRecord::from_object(object),
            _ => Err(AuditError::malformed("entry is not an object")),
        };
        match parsed {
            Ok(run) => runs.push(run),
            Err(e) => warn!(index, error = %e, "skipping invalid verifier run"),
        }
    }
    Ok(runs)
}

/// `{a, b}`, or `{}` when empty.
pub fn format_set(set: &BTreeSet<String>) -> String {
    format!("{{{}}}", set.iter().map(String::as_str).collect::<Vec<_>>().join(", "))
}

#[derive(Serialize)]
struct CsvRow<'a> {
    idx: usize,
    duration: u64,
    cid: &'a str,
    osdctl_version: &'a str,
    probe: String,
    arch: String,
    logpath: &'a str,
    errors: String,
    egress_failures: String,
}

/// Writes one CSV row per run, with parsed errors and egress failures in place of the
/// raw output.
pub fn write_csv<W: Write>(runs: &[RunRecord], writer: W) -> Result<(), AuditError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    for (idx, run) in runs.iter().enumerate() {
        csv_writer.serialize(CsvRow {
            idx,
            duration: run.duration.as_secs(),
            cid: &run.cid,
            osdctl_version: run.osdctl_version.as_str(),
            probe: run.probe.to_string(),
            arch: run.arch.to_string(),
            logpath: &run.logpath,
            errors: format_set(&run.errors()),
            egress_failures: format_set(&run.egress_failures()),
        })?;
    }
    csv_writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run_json(cid: &str) -> Value {
        json!({
            "duration": 42,
            "cid": cid,
            "osdctl_version": "0.35",
            "probe": "curl",
            "arch": "x86",
            "logpath": " /tmp/run.log ",
            "output": "egressURL error: quay.io:443 (Blocked)\nnetwork verifier error: timed out waiting for the condition\n",
        })
    }

    #[test]
    fn test_from_object() {
        let runs = parse_runs(&run_json("c1")).unwrap();
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert_eq!(run.duration, Duration::from_secs(42));
        assert_eq!(run.osdctl_version.verifier_version(), "1.0.0");
        assert_eq!(run.logpath, "/tmp/run.log");
        assert_eq!(run.egress_failures(), BTreeSet::from(["quay.io:443".to_string()]));
        assert_eq!(run.errors().len(), 1);
    }

    #[test]
    fn test_invalid_entries_are_skipped() {
        let mut bad_probe = run_json("c2");
        bad_probe["probe"] = json!("ping");
        let mut no_output = run_json("c3");
        no_output["output"] = json!("  ");
        let mut string_duration = run_json("c4");
        string_duration["duration"] = json!("7");

        let doc = Value::Array(vec![run_json("c1"), bad_probe, no_output, json!(3), string_duration]);
        let runs = parse_runs(&doc).unwrap();
        let cids: Vec<&str> = runs.iter().map(|r| r.cid.as_str()).collect();
        assert_eq!(cids, vec!["c1", "c4"]);
        assert_eq!(runs[1].duration, Duration::from_secs(7));
    }

    #[test]
    fn test_scalar_document_is_rejected() {
        assert!(parse_runs(&json!("hello")).is_err());
    }

    #[test]
    fn test_write_csv() {
        let mut clean = RunRecord::from_object(run_json("c2").as_object().unwrap()).unwrap();
        clean.output = "all good".to_string();
        let runs = vec![RunRecord::from_object(run_json("c1").as_object().unwrap()).unwrap(), clean];

        let mut out = Vec::new();
        write_csv(&runs, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "idx,duration,cid,osdctl_version,probe,arch,logpath,errors,egress_failures");
        assert_eq!(
            lines[1],
            "0,42,c1,0.35,curl,x86,/tmp/run.log,{timed out waiting for the condition},{quay.io:443}"
        );
        assert_eq!(lines[2], "1,42,c2,0.35,curl,x86,/tmp/run.log,{},{}");
    }
}
