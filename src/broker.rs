//! Paper broker: in-memory order book, position keeper, P&L, trade log.
//!
//! Fill policy: a limit order fills immediately at its limit price when the
//! cached price already crosses it; otherwise it queues and fills FIFO on
//! the first crossing tick, still at the limit price. Paper placements
//! never reject.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::EpochMs;
use crate::config::BrokeragePolicy;
use crate::types::{Fill, Side, Sym};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    Cancelled,
    NotPending,
}

#[derive(Debug, Clone)]
pub struct Order {
    pub id: Uuid,
    pub sym: Sym,
    pub side: Side,
    pub qty: i64,
    pub limit: f64,
    pub tag: String,
    pub status: OrderStatus,
    pub placed_ts_ms: EpochMs,
}

/// Per-instrument position.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Position {
    /// Signed; the long-only rules keep this >= 0.
    pub qty: i64,
    /// Weighted average entry price; 0 when flat.
    pub avg_price: f64,
    /// Accumulated realized P&L before brokerage.
    pub realized_gross: f64,
}

/// Append-only audit record, one per fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub ts_ms: EpochMs,
    pub sym: Sym,
    pub side: Side,
    pub qty: i64,
    pub price: f64,
    pub realized_delta: f64,
    pub brokerage_delta: f64,
    pub tag: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymPnl {
    pub qty: i64,
    pub avg_price: f64,
    pub realized_gross: f64,
    pub unrealized: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PnlReport {
    pub realized_gross: f64,
    pub brokerage: f64,
    pub realized_net: f64,
    pub unrealized: f64,
    pub total: f64,
    pub by_sym: BTreeMap<String, SymPnl>,
}

#[derive(Debug)]
pub struct PaperBroker {
    policy: BrokeragePolicy,
    orders: HashMap<Uuid, Order>,
    pending: HashMap<Sym, VecDeque<Uuid>>,
    positions: HashMap<Sym, Position>,
    trades: Vec<TradeRecord>,
    brokerage_total: f64,
}

fn crosses(side: Side, price: f64, limit: f64) -> bool {
    match side {
        Side::Buy => price <= limit,
        Side::Sell => price >= limit,
    }
}

impl PaperBroker {
    pub fn new(policy: BrokeragePolicy) -> Self {
        Self {
            policy,
            orders: HashMap::new(),
            pending: HashMap::new(),
            positions: HashMap::new(),
            trades: Vec::new(),
            brokerage_total: 0.0,
        }
    }

    /// Place a limit order. `cached_price` is the hub's last price for the
    /// sym; when it crosses, the order fills right here at the limit.
    /// Returns the order id and the immediate fill, if any.
    pub fn place_limit(
        &mut self,
        sym: &Sym,
        side: Side,
        qty: i64,
        limit: f64,
        tag: &str,
        cached_price: Option<f64>,
        now_ms: EpochMs,
    ) -> (Uuid, Option<Fill>) {
        let id = Uuid::new_v4();
        let order = Order {
            id,
            sym: sym.clone(),
            side,
            qty,
            limit,
            tag: tag.to_string(),
            status: OrderStatus::Pending,
            placed_ts_ms: now_ms,
        };
        info!(%sym, %side, qty, limit, tag, "limit order placed");
        self.orders.insert(id, order);

        if let Some(price) = cached_price {
            if crosses(side, price, limit) {
                let fill = self.fill_order(id, now_ms);
                return (id, Some(fill));
            }
        }
        self.pending.entry(sym.clone()).or_default().push_back(id);
        (id, None)
    }

    /// Fill every pending order for the sym that the tick crosses, in FIFO
    /// order, each at its own limit price.
    pub fn on_tick(&mut self, sym: &Sym, price: f64, ts_ms: EpochMs) -> Vec<Fill> {
        let queued: Vec<Uuid> = match self.pending.get(sym) {
            Some(queue) => queue.iter().copied().collect(),
            None => return Vec::new(),
        };
        let due: Vec<Uuid> = queued
            .into_iter()
            .filter(|id| {
                self.orders
                    .get(id)
                    .map(|o| o.status == OrderStatus::Pending && crosses(o.side, price, o.limit))
                    .unwrap_or(false)
            })
            .collect();
        if let Some(queue) = self.pending.get_mut(sym) {
            queue.retain(|id| !due.contains(id));
        }
        due.into_iter().map(|id| self.fill_order(id, ts_ms)).collect()
    }

    fn fill_order(&mut self, id: Uuid, ts_ms: EpochMs) -> Fill {
        let order = self.orders.get_mut(&id).expect("order exists");
        order.status = OrderStatus::Filled;
        let (sym, side, qty, limit, tag) = (
            order.sym.clone(),
            order.side,
            order.qty,
            order.limit,
            order.tag.clone(),
        );

        let pos = self.positions.entry(sym.clone()).or_default();
        let mut realized_delta = 0.0;
        let mut closed_notional = 0.0;
        match side {
            Side::Buy => {
                let new_qty = pos.qty + qty;
                if new_qty == 0 {
                    pos.avg_price = 0.0;
                } else {
                    pos.avg_price =
                        (pos.avg_price * pos.qty as f64 + limit * qty as f64) / new_qty as f64;
                }
                pos.qty = new_qty;
            }
            Side::Sell => {
                let closing = qty.min(pos.qty.max(0));
                if closing > 0 {
                    realized_delta = (limit - pos.avg_price) * closing as f64;
                    pos.realized_gross += realized_delta;
                    closed_notional = limit * closing as f64;
                }
                pos.qty -= qty;
                if pos.qty == 0 {
                    pos.avg_price = 0.0;
                } else if pos.qty < 0 {
                    // residual opens a short; the long-only rules never get here
                    pos.avg_price = limit;
                }
            }
        }

        let brokerage_delta = match self.policy {
            BrokeragePolicy::PerTradeRate { rate } => rate * closed_notional,
            BrokeragePolicy::GlobalProfitShare { share } => {
                let gross: f64 = self.positions.values().map(|p| p.realized_gross).sum();
                share * gross.max(0.0) - self.brokerage_total
            }
        };
        self.brokerage_total += brokerage_delta;

        info!(%sym, %side, qty, price = limit, realized_delta, "order filled");
        self.trades.push(TradeRecord {
            ts_ms,
            sym: sym.clone(),
            side,
            qty,
            price: limit,
            realized_delta,
            brokerage_delta,
            tag,
        });

        Fill {
            order_id: id,
            sym,
            side,
            qty,
            price: limit,
            ts_ms,
        }
    }

    /// Cancel a pending order. Already-filled or unknown ids report
    /// `NotPending`, a terminal non-error.
    pub fn cancel(&mut self, id: Uuid) -> CancelResult {
        match self.orders.get_mut(&id) {
            Some(order) if order.status == OrderStatus::Pending => {
                order.status = OrderStatus::Cancelled;
                let sym = order.sym.clone();
                if let Some(queue) = self.pending.get_mut(&sym) {
                    queue.retain(|q| *q != id);
                }
                debug!(%sym, %id, "order cancelled");
                CancelResult::Cancelled
            }
            _ => CancelResult::NotPending,
        }
    }

    pub fn status(&self, id: Uuid) -> Option<OrderStatus> {
        self.orders.get(&id).map(|o| o.status)
    }

    pub fn open_qty(&self, sym: &Sym) -> i64 {
        self.positions.get(sym).map(|p| p.qty).unwrap_or(0)
    }

    pub fn position(&self, sym: &Sym) -> Position {
        self.positions.get(sym).copied().unwrap_or_default()
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    /// P&L snapshot; unrealized marks open positions against `last`.
    pub fn pnl<F: Fn(&Sym) -> Option<f64>>(&self, last: F) -> PnlReport {
        let mut report = PnlReport::default();
        for (sym, pos) in &self.positions {
            let unrealized = match last(sym) {
                Some(price) if pos.qty != 0 => (price - pos.avg_price) * pos.qty as f64,
                _ => 0.0,
            };
            report.realized_gross += pos.realized_gross;
            report.unrealized += unrealized;
            report.by_sym.insert(
                sym.to_string(),
                SymPnl {
                    qty: pos.qty,
                    avg_price: pos.avg_price,
                    realized_gross: pos.realized_gross,
                    unrealized,
                },
            );
        }
        report.brokerage = self.brokerage_total;
        report.realized_net = report.realized_gross - report.brokerage;
        report.total = report.realized_net + report.unrealized;
        report
    }
}
