use roomscope_client::api::{ClusterClient, HttpDiscoveryApi};
use roomscope_client::config::Config;
use roomscope_client::engine::DiscoveryEngine;
use roomscope_client::ws::{connect_push_channel, forward_push_events};
use roomscope_shared::{Feature, Viewport};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load("config.nix").await?.client;

    let api = HttpDiscoveryApi::new(&config.api_base, config.user_id.clone(), config.request_timeout())?;
    let client = ClusterClient::new(api, config.engine.expand_factor);
    let handle = DiscoveryEngine::spawn(client, config.engine.clone(), config.user_id.clone());

    match connect_push_channel(&config.events_url).await {
        Ok(events) => {
            tokio::spawn(forward_push_events(events, handle.clone()));
        }
        Err(err) => warn!("Running without push events: {:#}", err),
    }

    handle.viewport_changed(Viewport::new(config.initial_bounds, config.initial_zoom));
    handle.load_rooms(true);

    let mut snapshots = handle.subscribe();
    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        if snapshot.loading {
            continue;
        }
        let (points, clusters) = snapshot
            .features
            .iter()
            .fold((0, 0), |(points, clusters), feature| match feature {
                Feature::Point(_) => (points + 1, clusters),
                Feature::Cluster(_) => (points, clusters + 1),
            });
        info!(
            points,
            clusters,
            listed = snapshot.list.rooms.len(),
            pending = snapshot.pending_room_ids.len(),
            hidden = snapshot.hidden_room_ids.len(),
            error = snapshot.error.as_deref(),
            "Discovery updated"
        );
    }

    Ok(())
}
