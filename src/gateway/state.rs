//! Shared runtime state for the gateway
//!
//! The engine is guarded by a single async mutex: the replay task and every
//! order-mutating handler serialize on it, which preserves the engine's
//! single-writer discipline. WebSocket fan-out goes through a broadcast bus
//! so one slow client never stalls the replay loop or its peers.

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::error::SimError;
use crate::executor::Executor;
use crate::gateway::binance;
use crate::replay::Replayer;
use crate::types::FundingEvent;

/// Account tags stored for API compatibility; they do not affect accounting.
#[derive(Debug, Clone)]
pub struct AccountMeta {
    pub leverage: u32,
    pub margin_type: String,
    pub dual_side: bool,
}

impl Default for AccountMeta {
    fn default() -> Self {
        Self {
            leverage: 1,
            margin_type: "cross".into(),
            dual_side: true,
        }
    }
}

pub struct GatewayState {
    pub cfg: RwLock<GatewayConfig>,
    pub engine: Mutex<Executor>,
    pub replayer: Mutex<Replayer>,
    /// Funding history for the loaded window (served by market endpoints).
    pub funding: RwLock<Vec<FundingEvent>>,
    /// Pre-serialized `{stream, data}` envelopes for WS clients.
    pub bus: broadcast::Sender<String>,
    pub meta: RwLock<AccountMeta>,
    pub run_id: RwLock<Option<String>>,
    replay_task: Mutex<Option<JoinHandle<()>>>,
}

pub type SharedState = Arc<GatewayState>;

impl GatewayState {
    pub fn new(
        cfg: GatewayConfig,
        engine: Executor,
        replayer: Replayer,
        funding: Vec<FundingEvent>,
        run_id: Option<String>,
    ) -> Self {
        let (bus, _rx) = broadcast::channel(1024);
        Self {
            cfg: RwLock::new(cfg),
            engine: Mutex::new(engine),
            replayer: Mutex::new(replayer),
            funding: RwLock::new(funding),
            bus,
            meta: RwLock::new(AccountMeta::default()),
            run_id: RwLock::new(run_id),
            replay_task: Mutex::new(None),
        }
    }

    /// Current mark for the configured symbol: the engine's last price, or
    /// the first loaded bar's open before any bar has been processed.
    pub async fn current_price(&self) -> f64 {
        let symbol = {
            let cfg = self.cfg.read().await;
            crate::types::Symbol::new(cfg.symbol.clone())
        };
        if let Some(px) = self.engine.lock().await.last_price(&symbol) {
            return px;
        }
        self.replayer
            .lock()
            .await
            .bars()
            .first()
            .map(|b| b.open)
            .unwrap_or(0.0)
    }
}

/// Start the replay task: pull bars from the replayer at the configured
/// pace, drive the engine, and broadcast bar-close and markPrice events.
pub async fn start_replay(state: SharedState) -> Result<(), SimError> {
    let mut rx = {
        let mut rp = state.replayer.lock().await;
        rp.stream()?
    };
    let interval = state.cfg.read().await.interval.clone();

    let st = state.clone();
    let handle = tokio::spawn(async move {
        while let Some(bar) = rx.recv().await {
            {
                let mut engine = st.engine.lock().await;
                if let Err(e) = engine.on_bar(&bar) {
                    warn!(error = %e, open_time = bar.open_time, "bar rejected");
                    continue;
                }
            }
            // Broadcast after releasing the engine lock.
            let _ = st.bus.send(binance::kline_close_envelope(&bar, &interval));
            let _ = st
                .bus
                .send(binance::mark_price_envelope(&bar.symbol, bar.close));
        }
        info!("replay stream drained");
    });

    *state.replay_task.lock().await = Some(handle);
    Ok(())
}

/// Cooperative stop: the in-flight bar finishes, then the task is joined.
pub async fn stop_replay(state: &GatewayState) {
    state.replayer.lock().await.stop();
    let handle = state.replay_task.lock().await.take();
    if let Some(h) = handle {
        if let Err(e) = h.await {
            warn!(error = %e, "replay task join failed");
        }
    }
}
