use crate::output::UserOutput;
use std::path::PathBuf;
use tor_fleet::config::format_exit_labels;
use tor_fleet::registry::{ClientRegistry, CreateRequest, Selector};

pub async fn run_create(
    registry: &ClientRegistry,
    port: u16,
    labels: Vec<String>,
    data_dir: Option<PathBuf>,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let view = registry
        .create_config(CreateRequest {
            port: Some(port),
            labels,
            data_directory: data_dir,
        })
        .await?;

    out.success(&format!("Created {}", view.config_path.display()));
    out.status(&format!("  SocksPort:   {}", view.socks_port));
    out.status(&format!("  ControlPort: {}", view.control_port));
    if !view.exit_labels.is_empty() {
        out.status(&format!("  ExitNodes:   {}", format_exit_labels(&view.exit_labels)));
    }
    if let Some(dir) = view.data_directory {
        out.status(&format!("  DataDirectory: {}", dir.display()));
    }
    out.status(&format!(
        "Start it with: tor-fleet start --port {}",
        view.socks_port
    ));
    Ok(())
}

pub async fn run_delete(
    registry: &ClientRegistry,
    selector: Selector,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let path = registry.delete_config(&selector).await?;
    out.success(&format!("Deleted {}", path.display()));
    Ok(())
}
