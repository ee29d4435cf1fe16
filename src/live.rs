//! Tokio wrapper around the synchronous engine for live operation.
//!
//! The engine stays single-threaded: one task owns it and drains a command
//! channel, sleeping until the next timer deadline between commands. Feed
//! adapters and webhook receivers talk to it only through the handle;
//! snapshots come back as copies over oneshot channels.

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use crate::broker::{PnlReport, TradeRecord};
use crate::clock::EpochMs;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::router::SignalOutcome;
use crate::types::{Signal, Sym};

pub enum EngineCommand {
    Tick {
        sym: Sym,
        price: f64,
        ts_ms: EpochMs,
    },
    Signal {
        signal: Signal,
        reply: oneshot::Sender<Result<SignalOutcome, EngineError>>,
    },
    Raw {
        text: String,
        reply: oneshot::Sender<Result<SignalOutcome, EngineError>>,
    },
    Pnl {
        reply: oneshot::Sender<PnlReport>,
    },
    Trades {
        reply: oneshot::Sender<Vec<TradeRecord>>,
    },
    Shutdown,
}

#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub async fn ingest_tick(&self, sym: Sym, price: f64, ts_ms: EpochMs) -> Result<()> {
        self.tx
            .send(EngineCommand::Tick { sym, price, ts_ms })
            .await
            .map_err(|_| anyhow!("engine task stopped"))
    }

    pub async fn submit_signal(&self, signal: Signal) -> Result<SignalOutcome, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Signal { signal, reply })
            .await
            .map_err(|_| EngineError::BrokerFatal("engine task stopped".to_string()))?;
        rx.await
            .map_err(|_| EngineError::BrokerFatal("engine task stopped".to_string()))?
    }

    pub async fn submit_raw(&self, text: String) -> Result<SignalOutcome, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Raw { text, reply })
            .await
            .map_err(|_| EngineError::BrokerFatal("engine task stopped".to_string()))?;
        rx.await
            .map_err(|_| EngineError::BrokerFatal("engine task stopped".to_string()))?
    }

    pub async fn pnl(&self) -> Result<PnlReport> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Pnl { reply })
            .await
            .map_err(|_| anyhow!("engine task stopped"))?;
        rx.await.map_err(|_| anyhow!("engine task stopped"))
    }

    pub async fn trades(&self) -> Result<Vec<TradeRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Trades { reply })
            .await
            .map_err(|_| anyhow!("engine task stopped"))?;
        rx.await.map_err(|_| anyhow!("engine task stopped"))
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(EngineCommand::Shutdown).await;
    }
}

/// Spawn the engine event loop. The returned handle is the only way in.
pub fn spawn(engine: Engine) -> (EngineHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(1024);
    let task = tokio::spawn(run(engine, rx));
    (EngineHandle { tx }, task)
}

async fn run(mut engine: Engine, mut rx: mpsc::Receiver<EngineCommand>) {
    info!("engine loop started");
    loop {
        let sleep_ms = engine
            .next_deadline()
            .map(|deadline| deadline.saturating_sub(engine.now_ms()));

        let cmd = if let Some(ms) = sleep_ms {
            tokio::select! {
                cmd = rx.recv() => cmd,
                _ = tokio::time::sleep(std::time::Duration::from_millis(ms)) => {
                    engine.fire_due();
                    continue;
                }
            }
        } else {
            rx.recv().await
        };

        match cmd {
            None | Some(EngineCommand::Shutdown) => break,
            Some(EngineCommand::Tick { sym, price, ts_ms }) => {
                engine.ingest_tick(&sym, price, ts_ms);
            }
            Some(EngineCommand::Signal { signal, reply }) => {
                let _ = reply.send(engine.submit_signal(signal));
            }
            Some(EngineCommand::Raw { text, reply }) => {
                let _ = reply.send(engine.submit_raw(&text));
            }
            Some(EngineCommand::Pnl { reply }) => {
                let _ = reply.send(engine.pnl());
            }
            Some(EngineCommand::Trades { reply }) => {
                let _ = reply.send(engine.trades());
            }
        }
    }
    let pnl = engine.pnl();
    info!(
        realized_net = pnl.realized_net,
        total = pnl.total,
        "engine loop stopped"
    );
}
