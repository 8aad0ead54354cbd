//! Kitchen display feed: re-fetches active orders whenever the backend
//! pushes an order event.
//!
//! ```text
//! POS_API_BASE_URL=http://localhost:8000 POS_WS_URL=ws://localhost:8000/ws \
//!     cargo run --example kitchen_feed
//! ```

use pos_link::{categories, ApiClient, ChannelConfig, EventChannel, OrderEvent};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let api = ApiClient::from_env().map_err(anyhow::Error::msg)?;
    let config = ChannelConfig::from_env().map_err(anyhow::Error::msg)?;
    let channel = EventChannel::websocket(config);

    let (refresh_tx, mut refresh_rx) = mpsc::unbounded_channel();
    for category in [categories::NEW_ORDER, categories::UPDATE_ORDER] {
        let refresh_tx = refresh_tx.clone();
        channel.subscribe(category, move |msg| {
            if let Ok(event) = msg.decode::<OrderEvent>() {
                tracing::info!(order_id = event.order_id, status = %event.status, "order changed");
            }
            let _ = refresh_tx.send(());
        });
    }
    channel.on_state_change(|state| tracing::info!(?state, "push channel"));
    channel.open()?;

    print_active_orders(&api).await;
    while refresh_rx.recv().await.is_some() {
        print_active_orders(&api).await;
    }
    Ok(())
}

async fn print_active_orders(api: &ApiClient) {
    match api.list_orders().await {
        Ok(orders) => {
            for order in orders.iter().filter(|o| o.status != "completed") {
                println!(
                    "#{:<6} {:<10} {} item(s)",
                    order.payment_number.as_deref().unwrap_or("-"),
                    order.status,
                    order.order_items.len()
                );
            }
        }
        Err(err) => tracing::error!(error = %err, "failed to load orders"),
    }
}
