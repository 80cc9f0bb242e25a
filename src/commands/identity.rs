use crate::output::UserOutput;
use tor_fleet::registry::{ClientRegistry, Selector};

pub async fn run_ip(
    registry: &ClientRegistry,
    selector: Selector,
    refresh: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let view = registry.require(&selector).await?;
    let identity = if refresh || (view.identity.is_none() && view.is_running()) {
        Some(registry.refresh_identity(&selector).await?)
    } else {
        view.identity
    };

    match identity {
        Some(identity) => {
            out.status(&format!("Client {}", view.socks_port));
            out.status(&format!("  Address:   {}", identity.address));
            out.status(&format!("  Region:    {}", identity.region));
            out.status(&format!("  Subregion: {}", identity.subregion));
            out.status(&format!("  Locality:  {}", identity.locality));
        }
        None => out.status(&format!(
            "Client {} is {} and has no known identity",
            view.socks_port, view.state
        )),
    }
    Ok(())
}
