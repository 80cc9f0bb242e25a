use super::finish_batch;
use crate::output::UserOutput;
use tor_fleet::registry::{ClientRegistry, Selector};

pub async fn run_start(
    registry: &ClientRegistry,
    selector: Selector,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let before = registry.require(&selector).await?;
    if before.external {
        out.status(&format!(
            "Client {} is managed by the system; not starting it",
            before.socks_port
        ));
        return Ok(());
    }
    if before.is_running() {
        out.status(&format!("Client {} is already running", before.socks_port));
        return Ok(());
    }

    out.progress(&format!("Starting client {}...", before.socks_port));
    match registry.start(&selector).await {
        Ok(view) => {
            out.finish_progress(" done");
            match view.identity {
                Some(identity) => out.success(&format!("  Identity: {}", identity)),
                None => out.warning("  Identity not resolved yet; try `tor-fleet ip` shortly"),
            }
            Ok(())
        }
        Err(e) => {
            out.finish_progress(" failed");
            Err(e.into())
        }
    }
}

pub async fn run_stop(
    registry: &ClientRegistry,
    selector: Selector,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let before = registry.require(&selector).await?;
    if before.external {
        out.status(&format!(
            "Client {} is managed by the system; not stopping it",
            before.socks_port
        ));
        return Ok(());
    }
    if !before.is_running() {
        out.status(&format!("Client {} is not running", before.socks_port));
        return Ok(());
    }

    out.progress(&format!("Stopping client {}...", before.socks_port));
    match registry.stop(&selector).await {
        Ok(_) => {
            out.finish_progress(" done");
            Ok(())
        }
        Err(e) => {
            out.finish_progress(" failed");
            Err(e.into())
        }
    }
}

pub async fn run_start_all(registry: &ClientRegistry, out: &dyn UserOutput) -> anyhow::Result<()> {
    out.status("Starting all stopped clients...");
    let report = registry.start_all().await;
    finish_batch("started", report, out)
}

pub async fn run_stop_all(registry: &ClientRegistry, out: &dyn UserOutput) -> anyhow::Result<()> {
    out.status("Stopping all running clients...");
    let report = registry.stop_all().await;
    finish_batch("stopped", report, out)
}
