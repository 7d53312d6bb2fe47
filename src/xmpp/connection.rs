// Connection management: connect with retry, the background event loop
// and disconnect.

use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio_xmpp::{AsyncClient as XMPPAsyncClient, BareJid, Event as XMPPEvent};
use xmpp_parsers::Element;

use super::ChatClient;

impl ChatClient {
    /// Connects to the account's server, spawns the background event
    /// loop and runs the post-online housekeeping (roster, discovery,
    /// pending replay). Up to three attempts with backoff.
    pub async fn connect(&self, password: &str) -> Result<()> {
        let jid: BareJid = self
            .jid
            .parse()
            .map_err(|e| anyhow!("Invalid account JID '{}': {}", self.jid, e))?;

        let mut last_error = None;
        for attempt in 1..=3 {
            info!("Connecting to XMPP server (attempt {}/3)", attempt);

            let client = XMPPAsyncClient::new(jid.clone(), password);
            {
                let mut guard = self.slot.lock().await;
                *guard = Some(client);
            }

            match self.wait_for_online(Duration::from_secs(10)).await {
                Ok(()) => {
                    info!("Connected to XMPP server as {}", self.jid);
                    tokio::spawn(run_event_loop(self.clone()));
                    self.handle_online().await;
                    return Ok(());
                }
                Err(e) => {
                    error!("Connection attempt {}/3 failed: {}", attempt, e);
                    last_error = Some(e);
                    let mut guard = self.slot.lock().await;
                    *guard = None;
                }
            }

            if attempt < 3 {
                // Backoff with jitter to avoid hammering the server.
                let backoff_base = 500 * 2u64.pow(attempt);
                let jitter = rand::random::<u64>() % 500;
                let backoff = Duration::from_millis(backoff_base + jitter);
                info!("Retrying connection in {:?}", backoff);
                tokio::time::sleep(backoff).await;
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("Failed to connect to XMPP server")))
    }

    async fn wait_for_online(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("Timed out waiting for connection"));
            }

            let event = {
                let mut guard = self.slot.lock().await;
                let client = guard
                    .as_mut()
                    .ok_or_else(|| anyhow!("Client went away during connect"))?;
                match tokio::time::timeout(Duration::from_millis(500), client.next()).await {
                    Ok(event) => event,
                    Err(_) => continue,
                }
            };

            match event {
                Some(XMPPEvent::Online { .. }) => return Ok(()),
                Some(XMPPEvent::Disconnected(e)) => {
                    return Err(anyhow!("Connection failed: {:?}", e));
                }
                Some(_) => continue,
                None => return Err(anyhow!("Stream ended during connection attempt")),
            }
        }
    }

    /// Sends unavailable presence and closes the stream. Taking the
    /// client out of the slot also stops the event loop.
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting from XMPP server");

        let client = {
            let mut guard = self.slot.lock().await;
            guard.take()
        };
        let mut client = match client {
            Some(client) => client,
            None => return Ok(()),
        };

        let presence = Element::builder("presence", "jabber:client")
            .attr("type", "unavailable")
            .build();
        if let Err(e) = client.send_stanza(presence).await {
            warn!("Failed to send unavailable presence: {}", e);
        }

        let result = client
            .close()
            .await
            .map_err(|e| anyhow!("Error during disconnect: {}", e));

        self.connected.store(false, Ordering::SeqCst);
        self.carbons_enabled.store(false, Ordering::SeqCst);
        result
    }
}

/// Background loop: pulls events off the stream and routes stanzas into
/// the pipeline. The lock is only held for short windows so outbound
/// sends get their turn.
async fn run_event_loop(client: ChatClient) {
    debug!("Event loop started");

    loop {
        let event = {
            let mut guard = client.slot.lock().await;
            let inner = match guard.as_mut() {
                Some(inner) => inner,
                None => break,
            };
            match tokio::time::timeout(Duration::from_millis(500), inner.next()).await {
                Ok(event) => event,
                Err(_) => continue,
            }
        };

        match event {
            Some(XMPPEvent::Online { .. }) => {
                info!("Connection re-established");
                client.handle_online().await;
            }
            Some(XMPPEvent::Disconnected(e)) => {
                warn!("Disconnected from server: {:?}", e);
                client.connected.store(false, Ordering::SeqCst);
                // Server-side carbon state dies with the stream.
                client.carbons_enabled.store(false, Ordering::SeqCst);
            }
            Some(XMPPEvent::Stanza(stanza)) => {
                client.handle_stanza(stanza).await;
            }
            #[allow(unreachable_patterns)]
            Some(_) => {}
            None => {
                client.connected.store(false, Ordering::SeqCst);
                break;
            }
        }
    }

    debug!("Event loop stopped");
}
