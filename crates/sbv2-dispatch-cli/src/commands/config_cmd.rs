//! `sbv2-dispatch config` command implementation

use colored::Colorize;
use sbv2_dispatch::DispatchConfig;
use sbv2_dispatch::config::ENV_PREFIX;
use std::path::Path;

/// Execute the `sbv2-dispatch config` command
pub fn run(config: &DispatchConfig, source: Option<&Path>, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }

    println!("{} Resolved dispatch configuration", "->".green());
    match source {
        Some(path) => println!("  File: {}", path.display().to_string().cyan()),
        None => println!("  File: {}", "(none, defaults only)".dimmed()),
    }
    println!("  Environment prefix: {}_*", ENV_PREFIX.cyan());
    println!();

    let rows = render_rows(config);
    let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    for (key, value) in rows {
        println!("  {:<width$} = {}", key, value, width = width);
    }

    Ok(())
}

fn render_rows(config: &DispatchConfig) -> Vec<(&'static str, String)> {
    let overrides = if config.priority_overrides.is_empty() {
        "-".to_string()
    } else {
        config
            .priority_overrides
            .iter()
            .map(|(name, prio)| format!("{name}={prio}"))
            .collect::<Vec<_>>()
            .join(", ")
    };

    vec![
        ("probe_timeout_ms", config.probe_timeout_ms.to_string()),
        ("load_timeout_ms", config.load_timeout_ms.to_string()),
        (
            "disabled_backends",
            if config.disabled_backends.is_empty() {
                "-".to_string()
            } else {
                config.disabled_backends.join(", ")
            },
        ),
        ("priority_overrides", overrides),
        (
            "backend_override",
            config.backend_override.clone().unwrap_or_else(|| "-".to_string()),
        ),
        ("device_id", config.device_id.to_string()),
        (
            "num_threads",
            config
                .num_threads
                .map(|n| n.to_string())
                .unwrap_or_else(|| "auto".to_string()),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn rows_show_defaults() {
        let rows = render_rows(&DispatchConfig::default());
        let find = |key: &str| rows.iter().find(|(k, _)| *k == key).map(|(_, v)| v.clone());
        assert_eq!(find("probe_timeout_ms").as_deref(), Some("30000"));
        assert_eq!(find("disabled_backends").as_deref(), Some("-"));
        assert_eq!(find("num_threads").as_deref(), Some("auto"));
    }

    #[test]
    fn rows_reflect_loaded_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "disabled_backends = [\"directml\", \"coreml\"]\n[priority_overrides]\ncpu = 0"
        )
        .unwrap();
        let config = DispatchConfig::load_with_env(Some(file.path()), Some(Default::default())).unwrap();
        let rows = render_rows(&config);
        assert!(rows.contains(&("disabled_backends", "directml, coreml".to_string())));
        assert!(rows.contains(&("priority_overrides", "cpu=0".to_string())));
    }
}
