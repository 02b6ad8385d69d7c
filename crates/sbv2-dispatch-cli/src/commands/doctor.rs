//! `sbv2-dispatch doctor` command implementation

use colored::Colorize;
use comfy_table::{Cell, Color, Table};
use sbv2_dispatch::{BackendKind, DispatchConfig, HostCapabilities};
use serde::Serialize;

/// Hosts with less free memory than this get a warning
const LOW_MEMORY_BYTES: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DoctorSeverity {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Serialize)]
pub struct DoctorCheck {
    pub id: String,
    pub title: String,
    pub severity: DoctorSeverity,
    pub details: String,
    pub recommendation: Option<String>,
}

/// Host-level verdict for one built-in backend
#[derive(Debug, Serialize)]
pub struct BackendVerdict {
    pub name: String,
    pub priority: i32,
    pub usable: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DoctorSummary {
    pub passed: usize,
    pub warnings: usize,
    pub failed: usize,
}

#[derive(Debug, Serialize)]
pub struct DoctorReport {
    pub host: HostCapabilities,
    pub strict: bool,
    /// First backend selection would try, if any can run
    pub preferred: Option<String>,
    pub backends: Vec<BackendVerdict>,
    pub summary: DoctorSummary,
    pub checks: Vec<DoctorCheck>,
}

pub fn run(config: &DispatchConfig, json: bool, strict: bool) -> anyhow::Result<()> {
    let host = HostCapabilities::detect_cached();
    let report = build_report(&host, config, strict);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if strict && report.summary.failed > 0 {
        anyhow::bail!(
            "doctor strict mode failed with {} failing checks",
            report.summary.failed
        );
    }

    Ok(())
}

fn build_report(host: &HostCapabilities, config: &DispatchConfig, strict: bool) -> DoctorReport {
    let backends = backend_verdicts(host, config);
    let preferred = backends.iter().find(|b| b.usable).map(|b| b.name.clone());

    let mut checks = vec![check_memory(host)];
    checks.extend(backends.iter().map(check_backend));
    checks.push(check_selection(preferred.as_deref()));

    let summary = summarize_checks(&checks);

    DoctorReport {
        host: host.clone(),
        strict,
        preferred,
        backends,
        summary,
        checks,
    }
}

/// Built-in backends in effective priority order, with host and config verdicts.
fn backend_verdicts(host: &HostCapabilities, config: &DispatchConfig) -> Vec<BackendVerdict> {
    let mut verdicts: Vec<BackendVerdict> = BackendKind::ALL
        .iter()
        .map(|kind| {
            let name = kind.name();
            let reason = config
                .exclusion_reason(name)
                .or_else(|| kind.host_requirement(host).err().map(|e| e.to_string()));
            BackendVerdict {
                name: name.to_string(),
                priority: config.effective_priority(name, kind.default_priority()),
                usable: reason.is_none(),
                reason,
            }
        })
        .collect();
    // stable: ties keep default order
    verdicts.sort_by_key(|v| v.priority);
    verdicts
}

fn check_memory(host: &HostCapabilities) -> DoctorCheck {
    let details = format!(
        "{} logical cores, {} available of {} total",
        host.cpu_cores,
        format_bytes(host.available_ram_bytes),
        format_bytes(host.total_ram_bytes)
    );
    if host.available_ram_bytes < LOW_MEMORY_BYTES {
        DoctorCheck {
            id: "host-memory".to_string(),
            title: "Host memory".to_string(),
            severity: DoctorSeverity::Warn,
            details,
            recommendation: Some(
                "BERT and voice models need roughly 2 GiB; close other processes or lower max_loaded_models."
                    .to_string(),
            ),
        }
    } else {
        DoctorCheck {
            id: "host-memory".to_string(),
            title: "Host memory".to_string(),
            severity: DoctorSeverity::Pass,
            details,
            recommendation: None,
        }
    }
}

fn check_backend(verdict: &BackendVerdict) -> DoctorCheck {
    let id = format!("backend-{}", verdict.name);
    let title = format!("Backend {} (priority {})", verdict.name, verdict.priority);
    match &verdict.reason {
        None => DoctorCheck {
            id,
            title,
            severity: DoctorSeverity::Pass,
            details: "Host requirement satisfied.".to_string(),
            recommendation: None,
        },
        Some(reason) => DoctorCheck {
            id,
            title,
            severity: DoctorSeverity::Warn,
            details: reason.clone(),
            recommendation: None,
        },
    }
}

fn check_selection(preferred: Option<&str>) -> DoctorCheck {
    match preferred {
        Some(name) => DoctorCheck {
            id: "selection".to_string(),
            title: "Backend selection".to_string(),
            severity: DoctorSeverity::Pass,
            details: format!("Selection will try '{name}' first."),
            recommendation: None,
        },
        None => DoctorCheck {
            id: "selection".to_string(),
            title: "Backend selection".to_string(),
            severity: DoctorSeverity::Fail,
            details: "No built-in backend can run on this host with the current configuration."
                .to_string(),
            recommendation: Some(
                "Remove 'cpu' from disabled_backends or clear backend_override.".to_string(),
            ),
        },
    }
}

fn summarize_checks(checks: &[DoctorCheck]) -> DoctorSummary {
    let count = |severity: DoctorSeverity| checks.iter().filter(|c| c.severity == severity).count();
    DoctorSummary {
        passed: count(DoctorSeverity::Pass),
        warnings: count(DoctorSeverity::Warn),
        failed: count(DoctorSeverity::Fail),
    }
}

fn print_report(report: &DoctorReport) {
    let host = &report.host;
    println!("{} sbv2-dispatch Doctor Report", "→".green());
    println!("  Host: {} / {}", host.os.to_string().cyan(), host.arch.cyan());
    println!(
        "  Strict mode: {}",
        if report.strict { "on" } else { "off" }
    );
    println!();

    let mut table = Table::new();
    table.set_header(vec!["Backend", "Priority", "Status", "Reason"]);
    for verdict in &report.backends {
        let status = if verdict.usable {
            Cell::new("available").fg(Color::Green)
        } else {
            Cell::new("unavailable").fg(Color::Yellow)
        };
        table.add_row(vec![
            Cell::new(&verdict.name),
            Cell::new(verdict.priority),
            status,
            Cell::new(verdict.reason.as_deref().unwrap_or("-")),
        ]);
    }
    println!("{table}");
    println!();

    for check in &report.checks {
        let (icon, colorized_title) = match check.severity {
            DoctorSeverity::Pass => ("✓".green(), check.title.green()),
            DoctorSeverity::Warn => ("!".yellow(), check.title.yellow()),
            DoctorSeverity::Fail => ("✗".red(), check.title.red()),
        };

        println!("{} {} [{}]", icon, colorized_title, check.id);
        println!("    {}", check.details);
        if let Some(recommendation) = &check.recommendation {
            println!("    Recommendation: {}", recommendation);
        }
    }

    println!();
    println!(
        "Summary: {} passed, {} warnings, {} failed",
        report.summary.passed.to_string().green(),
        report.summary.warnings.to_string().yellow(),
        report.summary.failed.to_string().red()
    );
}

fn format_bytes(bytes: u64) -> String {
    format!("{:.1} GiB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
}
