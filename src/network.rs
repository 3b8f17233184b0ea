//! Connectivity tracking with a settle window.
//!
//! Raw reachability samples (from the platform or a [`ConnectivityProbe`])
//! go in through [`NetworkMonitor::report`]; a new state is published only
//! after it has held for the whole settle window, so a flapping link does not
//! trigger a flush on every blip.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn from_reachable(reachable: bool) -> Self {
        if reachable {
            Connectivity::Online
        } else {
            Connectivity::Offline
        }
    }

    pub fn is_online(self) -> bool {
        self == Connectivity::Online
    }
}

impl std::fmt::Display for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connectivity::Online => write!(f, "ONLINE"),
            Connectivity::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// Something that can tell whether the server is reachable right now.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// Reachable when the server answers at all, whatever the status code.
pub struct HttpProbe {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(client: Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn check(&self) -> bool {
        self.client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .is_ok()
    }
}

const EVENT_CAPACITY: usize = 16;

/// Debounced ONLINE/OFFLINE state machine.
pub struct NetworkMonitor {
    samples: mpsc::UnboundedSender<Connectivity>,
    state: watch::Receiver<Connectivity>,
    events: broadcast::Sender<Connectivity>,
}

impl NetworkMonitor {
    /// Starts the debouncer on the current tokio runtime. The task ends when
    /// the monitor and every probe loop are dropped.
    pub fn spawn(initial: Connectivity, settle: Duration) -> Self {
        let (samples, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(initial);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        tokio::spawn(debounce(initial, settle, rx, state_tx, events.clone()));
        info!(%initial, settle_ms = settle.as_millis() as u64, "Network monitor started");
        Self {
            samples,
            state,
            events,
        }
    }

    /// Feeds one raw reachability observation.
    pub fn report(&self, reachable: bool) {
        if self
            .samples
            .send(Connectivity::from_reachable(reachable))
            .is_err()
        {
            debug!("Network monitor stopped; sample dropped");
        }
    }

    /// Transition events. Only settled changes are sent.
    pub fn subscribe(&self) -> broadcast::Receiver<Connectivity> {
        self.events.subscribe()
    }

    /// Current settled state, for callers that prefer a level to edges.
    pub fn status(&self) -> watch::Receiver<Connectivity> {
        self.state.clone()
    }

    pub fn current(&self) -> Connectivity {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    /// Polls `probe` every `interval` and reports each result.
    pub fn spawn_probe(
        &self,
        probe: impl ConnectivityProbe + 'static,
        interval: Duration,
    ) -> JoinHandle<()> {
        let samples = self.samples.clone();
        tokio::spawn(async move {
            loop {
                let reachable = probe.check().await;
                if samples.send(Connectivity::from_reachable(reachable)).is_err() {
                    break;
                }
                sleep(interval).await;
            }
        })
    }
}

async fn debounce(
    mut current: Connectivity,
    settle: Duration,
    mut samples: mpsc::UnboundedReceiver<Connectivity>,
    state: watch::Sender<Connectivity>,
    events: broadcast::Sender<Connectivity>,
) {
    while let Some(first) = samples.recv().await {
        if first == current {
            continue;
        }

        let mut candidate = first;
        let mut deadline = Instant::now() + settle;
        let mut closed = false;
        loop {
            match timeout_at(deadline, samples.recv()).await {
                Ok(Some(sample)) if sample != candidate => {
                    candidate = sample;
                    deadline = Instant::now() + settle;
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        if candidate != current {
            info!(from = %current, to = %candidate, "Connectivity changed");
            current = candidate;
            state.send_replace(current);
            // No subscribers is fine; the watch channel still has the level.
            let _ = events.send(current);
        } else {
            debug!(state = %current, "Connectivity flapped back within settle window");
        }

        if closed {
            break;
        }
    }
}
