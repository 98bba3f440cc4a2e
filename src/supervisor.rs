//! Reconnect loop keeping one [`AmiClient`] logged in

use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::{
    connection::AmiClient,
    constants::{DEFAULT_KEEPALIVE_MS, DEFAULT_LOGIN_EVENTS, DEFAULT_RECONNECT_DELAY_MS},
    error::AmiResult,
};

/// Drives connect, keepalive and the read loop, retrying after a fixed
/// back-off until told to shut down.
///
/// ```rust,no_run
/// # async fn example() -> Result<(), ami_statsd::AmiError> {
/// use ami_statsd::{AmiClient, ClientOptions, Supervisor};
/// use std::time::Duration;
///
/// let client = AmiClient::new("admin:secret@127.0.0.1".parse()?, ClientOptions::default());
/// let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
/// let supervisor = Supervisor::new(client).reconnect_delay(Duration::from_secs(1));
/// let task = tokio::spawn(async move { supervisor.run(shutdown_rx).await });
///
/// let _ = shutdown_tx.send(true);
/// let _ = task.await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Supervisor {
    client: AmiClient,
    login_params: Vec<(String, String)>,
    keepalive: Duration,
    reconnect_delay: Duration,
}

impl Supervisor {
    /// Supervise `client` with `Events: call,command`, a 1s keepalive and a
    /// 100ms reconnect delay.
    pub fn new(client: AmiClient) -> Self {
        Self {
            client,
            login_params: vec![("Events".to_string(), DEFAULT_LOGIN_EVENTS.to_string())],
            keepalive: Duration::from_millis(DEFAULT_KEEPALIVE_MS),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
        }
    }

    /// Replace the extra `Login` parameters.
    pub fn login_params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.login_params = params
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    pub fn keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = interval;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn client(&self) -> &AmiClient {
        &self.client
    }

    /// Keep the client connected until `shutdown` turns `true` or its sender
    /// is dropped, then stop the keepalive and close the connection.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let address = self
            .client
            .target()
            .address();

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            self.client
                .stop_keep_alive();
            tokio::select! {
                result = self.session() => {
                    if let Err(e) = result {
                        warn!("[SUPERVISOR] Connection to {} ended: {}", address, e);
                    }
                }
                _ = shutdown.changed() => break,
            }
            self.client
                .stop_keep_alive();

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = shutdown.changed() => break,
            }
            info!("[SUPERVISOR] Reconnecting to {}", address);
        }

        info!("[SUPERVISOR] Shutting down");
        self.client
            .stop_keep_alive();
        self.client
            .close()
            .await;
    }

    /// One connection lifetime. Only returns once the connection is gone.
    async fn session(&self) -> AmiResult<()> {
        if let Err(e) = self
            .client
            .connect(
                self.login_params
                    .iter()
                    .cloned(),
            )
            .await
        {
            error!("[SUPERVISOR] Connect failed: {}", e);
            return Err(e);
        }
        self.client
            .keep_alive(self.keepalive)?;
        self.client
            .run()
            .await
    }
}
