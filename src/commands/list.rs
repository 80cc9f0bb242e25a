use crate::output::UserOutput;
use serde_json::json;
use tor_fleet::config::format_exit_labels;
use tor_fleet::registry::{ClientRegistry, ClientView, ListFilter};

pub async fn run_list(registry: &ClientRegistry, json: bool, out: &dyn UserOutput) -> anyhow::Result<()> {
    let views = registry.list(ListFilter::All).await;
    let report = registry.startup_report();
    for (path, err) in &report.skipped {
        out.warning(&format!("Skipped {}: {}", path.display(), err));
    }
    print_views(&views, json, "No descriptors found", out)
}

pub async fn run_running(
    registry: &ClientRegistry,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let views = registry.list(ListFilter::Running).await;
    print_views(&views, json, "No running clients", out)
}

fn print_views(
    views: &[ClientView],
    json: bool,
    empty: &str,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    if json {
        let rows: Vec<_> = views.iter().map(view_json).collect();
        out.status(&serde_json::to_string_pretty(&rows)?);
    } else if views.is_empty() {
        out.status(empty);
    } else {
        for line in render_table(views) {
            out.status(&line);
        }
    }
    Ok(())
}

fn view_json(view: &ClientView) -> serde_json::Value {
    json!({
        "config": view.config_path,
        "socks_port": view.socks_port,
        "control_port": view.control_port,
        "labels": view.exit_labels,
        "state": view.state.to_string(),
        "pid": view.pid.map(|p| p.to_string()),
        "identity": view.identity,
        "data_directory": view.data_directory,
        "external": view.external,
        "orphaned": view.orphaned,
    })
}

/// Plain aligned columns; the index column matches `--index`.
fn render_table(views: &[ClientView]) -> Vec<String> {
    let header = [
        "#", "CONFIG", "SOCKS", "CONTROL", "LABELS", "STATE", "PID", "IDENTITY",
    ];
    let mut rows: Vec<[String; 8]> = vec![header.map(str::to_string)];
    for (index, view) in views.iter().enumerate() {
        let mut config = view.config_name();
        if view.orphaned {
            config.push_str(" (orphaned)");
        }
        rows.push([
            index.to_string(),
            config,
            view.socks_port.to_string(),
            view.control_port.to_string(),
            if view.exit_labels.is_empty() {
                "-".to_string()
            } else {
                format_exit_labels(&view.exit_labels)
            },
            view.state.to_string(),
            view.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            view.identity
                .as_ref()
                .map(|i| i.to_string())
                .unwrap_or_else(|| "-".to_string()),
        ]);
    }

    let mut widths = [0usize; 8];
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.chars().count());
        }
    }

    rows.iter()
        .map(|row| {
            row.iter()
                .zip(widths.iter())
                .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
                .collect::<Vec<_>>()
                .join("  ")
                .trim_end()
                .to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tor_fleet::daemon::{DaemonState, ProcessRef};
    use tor_fleet::identity::Identity;

    fn view(port: u16, name: &str) -> ClientView {
        ClientView {
            socks_port: port,
            control_port: port + 1,
            exit_labels: ["us".to_string()].into_iter().collect(),
            state: DaemonState::Running,
            pid: Some(ProcessRef::Pid(321)),
            identity: Some(Identity {
                address: "9.9.9.9".to_string(),
                region: "US".to_string(),
                subregion: "CA".to_string(),
                locality: "Berkeley".to_string(),
            }),
            config_path: PathBuf::from(format!("/etc/tor/{}", name)),
            data_directory: None,
            external: false,
            orphaned: false,
        }
    }

    #[test]
    fn table_columns_line_up() {
        let mut default = view(9050, "torrc");
        default.pid = Some(ProcessRef::External);
        default.exit_labels.clear();
        let lines = render_table(&[default, view(9060, "torrc.1")]);

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("#  CONFIG"));
        assert!(lines[1].contains("-1"));
        assert!(lines[2].contains("{us}"));
        assert!(lines[2].contains("9.9.9.9 (US, CA, Berkeley)"));
        let socks_col = lines[0].find("SOCKS").unwrap();
        assert_eq!(&lines[2][socks_col..socks_col + 4], "9060");
    }

    #[test]
    fn empty_list_prints_placeholder() {
        let out = crate::output::CapturedOutput::default();
        print_views(&[], false, "No running clients", &out).unwrap();
        assert_eq!(out.text(), "No running clients");
    }

    #[test]
    fn json_rows_carry_sentinel_pid() {
        let mut default = view(9050, "torrc");
        default.pid = Some(ProcessRef::External);
        let value = view_json(&default);
        assert_eq!(value["pid"], "-1");
        assert_eq!(value["identity"]["address"], "9.9.9.9");
    }
}
