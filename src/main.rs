use anyhow::{anyhow, Context};
use dcchat_lib::logger::init_logging;
use dcchat_lib::peer::WebRtcFactory;
use dcchat_lib::{IceConfig, Session, SessionConfig, SessionEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let text = std::env::args().nth(1).unwrap_or_else(|| "hello".to_string());
    let config = SessionConfig::from_env().context("reading DCCHAT_* settings")?;
    let factory = WebRtcFactory::new(IceConfig::host_only()).context("configuring ICE")?;
    let session = Session::new(config, Arc::new(factory));
    let mut events = session.subscribe();

    session.connect().await.context("connecting endpoints")?;
    info!(summary = ?session.summary(), "connected");

    session.send_message(&text).await.context("sending message")?;
    let received = tokio::time::timeout(RECEIVE_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::MessageReceived { text, .. }) => return Some(text),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .await;

    let outcome = match received {
        Ok(Some(text)) => {
            println!("remote received: {text}");
            Ok(())
        }
        Ok(None) => Err(anyhow!("session closed before the message arrived")),
        Err(_) => Err(anyhow!("message not delivered within {RECEIVE_TIMEOUT:?}")),
    };

    session.disconnect().await;
    outcome
}
