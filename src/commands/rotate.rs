use super::finish_batch;
use crate::output::UserOutput;
use tor_fleet::registry::{ClientRegistry, Selector};

pub async fn run_rotate(
    registry: &ClientRegistry,
    selector: Option<Selector>,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let Some(selector) = selector else {
        out.status("Rotating identities of all running clients...");
        let report = registry.rotate_all().await;
        for port in &report.succeeded {
            if let Ok(Some(identity)) = registry.identity(&Selector::Port(*port)).await {
                out.status(&format!("  {}: {}", port, identity));
            }
        }
        return finish_batch("rotated", report, out);
    };

    let view = registry.rotate(&selector).await?;
    match view.identity {
        Some(identity) => out.success(&format!(
            "Client {} has a new identity: {}",
            view.socks_port, identity
        )),
        None => out.success(&format!("Client {} rotated", view.socks_port)),
    }
    Ok(())
}
