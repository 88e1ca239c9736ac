//! Palaver demo: connects to a channel and echoes host events to the log.
//!
//! ```text
//! palaver-demo <brand-id> <channel-id> [message]
//! ```

use anyhow::{bail, Context};
use palaver_client::{logging, ChatClient, ClientConfig, ClientEvent, OutboundMessage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let mut args = std::env::args().skip(1);
    let (Some(brand_id), Some(channel_id)) = (args.next(), args.next()) else {
        bail!("usage: palaver-demo <brand-id> <channel-id> [message]");
    };
    let brand_id: i64 = brand_id.parse().context("brand id must be a number")?;
    let greeting = args.next();

    let (client, mut events) = ChatClient::new(ClientConfig::from_env())?;
    client.prepare(brand_id, &channel_id).await?;
    client.connect().await?;
    tracing::info!(mode = ?client.chat_mode(), "chat ready");

    if let Some(text) = greeting {
        let thread_id = match client.threads().await.first() {
            Some(thread) => thread.id,
            None => client.registry().create(Default::default()).await?,
        };
        client.registry().send(thread_id, OutboundMessage::text(text)).await?;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ClientEvent::ThreadUpdated(thread)) => {
                    if let Some(last) = thread.messages.last() {
                        tracing::info!(thread_id = %thread.id, state = ?thread.state, content = ?last.content, "thread updated");
                    }
                }
                Some(ClientEvent::Disconnected { unexpectedly: true }) => bail!("connection lost"),
                Some(other) => tracing::debug!(event = ?other, "client event"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                client.sign_out().await;
                break;
            }
        }
    }
    Ok(())
}
