//! Per-instrument trading state machine.
//!
//! Implements the windowed entry/exit strategy:
//! - a SELL signal opens a 60s SELL window: in-position it exits on the
//!   first tick (no-flip), flat it watches for a breakout above the SELL
//!   anchor or a discount below the last entry cycle's start, either of
//!   which flips into a BUY window with a forced anchor;
//! - a BUY signal anchors and places an entry immediately, opening a BUY
//!   window when idle;
//! - inside a BUY window, a tick below the defended anchor stops out and
//!   silences further BUY signals until the window deadline, while a tick
//!   above the anchor when flat re-enters and restarts the window;
//! - an expired BUY window re-enters when flat and the cached price sits
//!   above the anchor; an expired SELL window restarts on the cached price.
//!
//! Two clocks feed the machine: tick deliveries and window expiries. Every
//! callback carries the window id it was armed under and no-ops when the
//! window has been superseded.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::PaperBroker;
use crate::clock::{EpochMs, TimerId, TimerPayload, TimerService};
use crate::config::EngineConfig;
use crate::hub::{SubId, SubscriberId, TickHub};
use crate::sizing::Sizer;
use crate::types::{round_to_tick, tags, Side, Sym};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    Idle,
    InSellWindow,
    InBuyWindow,
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineState::Idle => write!(f, "IDLE"),
            MachineState::InSellWindow => write!(f, "IN_SELL_WINDOW"),
            MachineState::InBuyWindow => write!(f, "IN_BUY_WINDOW"),
        }
    }
}

/// Borrowed engine services a transition may touch. Everything the machine
/// does happens synchronously through this context, so a single event runs
/// to completion before the next is observed.
pub struct MachineCtx<'a> {
    pub now_ms: EpochMs,
    pub timers: &'a mut TimerService,
    pub hub: &'a mut TickHub,
    pub broker: &'a mut PaperBroker,
    pub sizer: &'a Sizer,
    pub cfg: &'a EngineConfig,
}

/// Coarse persisted form; windows are re-armed on restore when their
/// deadline is still in the future.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub sym: Sym,
    pub state: MachineState,
    pub window_id: u64,
    pub window_ends_at_ms: EpochMs,
    pub window_anchor: Option<f64>,
    pub window_had_pos: bool,
    pub saved_buy_ltp: Option<f64>,
    pub saved_last_buy_ltp: Option<f64>,
    pub saved_sell_ltp: Option<f64>,
    pub sell_start_anchor: Option<f64>,
    pub pending_buy_after_sell: bool,
    pub silenced_until_ms: Option<EpochMs>,
    /// A stop-out left the window deadline armed for the flat re-entry
    /// check; survives restarts alongside the silencing deadline.
    #[serde(default)]
    pub reentry_check_armed: bool,
    pub entry_order_id: Option<Uuid>,
}

pub struct SymbolMachine {
    sym: Sym,
    state: MachineState,
    window_id: u64,
    window_deadline_ms: EpochMs,
    /// BUY window anchor, fixed at window start. Later BUY signals may move
    /// `saved_buy_ltp` for the next window without touching this one.
    window_anchor: Option<f64>,
    /// SELL window: whether a position existed when the window opened.
    window_had_pos: bool,
    window_timer: Option<TimerId>,
    tick_sub: Option<SubId>,
    exited_this_window: bool,
    /// Set by a stop-out: the window timer stays armed so the deadline can
    /// still run the flat re-entry check.
    reentry_check_armed: bool,
    silenced_until_ms: Option<EpochMs>,
    saved_buy_ltp: Option<f64>,
    saved_last_buy_ltp: Option<f64>,
    saved_sell_ltp: Option<f64>,
    sell_start_anchor: Option<f64>,
    pending_buy_after_sell: bool,
    entry_order_id: Option<Uuid>,
}

impl SymbolMachine {
    pub fn new(sym: Sym) -> Self {
        Self {
            sym,
            state: MachineState::Idle,
            window_id: 0,
            window_deadline_ms: 0,
            window_anchor: None,
            window_had_pos: false,
            window_timer: None,
            tick_sub: None,
            exited_this_window: false,
            reentry_check_armed: false,
            silenced_until_ms: None,
            saved_buy_ltp: None,
            saved_last_buy_ltp: None,
            saved_sell_ltp: None,
            sell_start_anchor: None,
            pending_buy_after_sell: false,
            entry_order_id: None,
        }
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    // ------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------

    /// Dispatch a signal whose price has already been resolved by the
    /// router's missing-price policy.
    pub fn on_signal(&mut self, side: Side, price: f64, ctx: &mut MachineCtx<'_>) {
        match side {
            Side::Buy => self.handle_buy(price, None, true, ctx),
            Side::Sell => self.handle_sell(price, ctx),
        }
    }

    fn handle_sell(&mut self, l: f64, ctx: &mut MachineCtx<'_>) {
        info!(sym = %self.sym, state = %self.state, at_price = l, "SELL signal");
        self.saved_sell_ltp = Some(l);
        self.pending_buy_after_sell = true;
        self.open_window(MachineState::InSellWindow, ctx);
    }

    fn handle_buy(
        &mut self,
        l: f64,
        forced: Option<(f64, &'static str)>,
        from_signal: bool,
        ctx: &mut MachineCtx<'_>,
    ) {
        if let Some(until) = self.silenced_until_ms {
            if ctx.now_ms < until {
                info!(sym = %self.sym, until, "BUY signal silenced after stop-out, ignored");
                return;
            }
            self.silenced_until_ms = None;
        }

        let (anchor, tag) = match forced {
            Some((a, tag)) => (a, tag),
            None => (l, tags::BUY_SIGNAL_PREWINDOW),
        };
        info!(sym = %self.sym, state = %self.state, anchor, tag, "BUY signal");

        self.saved_buy_ltp = Some(anchor);
        self.saved_last_buy_ltp = Some(anchor);
        // Only a genuine BUY signal starts the entry cycle; an internal
        // forced-anchor flip leaves the flag for the next real signal.
        if from_signal && self.pending_buy_after_sell {
            self.sell_start_anchor = Some(l);
            self.pending_buy_after_sell = false;
        }

        let open = ctx.broker.open_qty(&self.sym);
        let qty = match ctx.sizer.qty_for_entry(&self.sym, anchor, open) {
            Ok(q) => q,
            Err(e) => {
                warn!(sym = %self.sym, error = %e, "entry sizing failed, intent dropped");
                return;
            }
        };
        let limit = round_to_tick(anchor + ctx.cfg.entry_offset, ctx.cfg.tick_size);
        self.place(Side::Buy, qty, limit, tag, ctx);

        if self.state == MachineState::Idle {
            self.window_anchor = Some(anchor);
            self.open_window(MachineState::InBuyWindow, ctx);
        }
    }

    // ------------------------------------------------------------------
    // Ticks
    // ------------------------------------------------------------------

    pub fn on_tick(&mut self, price: f64, cb_window_id: u64, ctx: &mut MachineCtx<'_>) {
        if cb_window_id != self.window_id {
            debug!(sym = %self.sym, cb_window_id, current = self.window_id, "late tick callback discarded");
            return;
        }
        match self.state {
            MachineState::InSellWindow => self.sell_window_tick(price, ctx),
            MachineState::InBuyWindow => self.buy_window_tick(price, ctx),
            MachineState::Idle => {}
        }
    }

    fn sell_window_tick(&mut self, price: f64, ctx: &mut MachineCtx<'_>) {
        if self.window_had_pos {
            // No-flip rule: exit exactly the open size on the first tick,
            // then sit out the rest of the window.
            if self.exited_this_window {
                return;
            }
            let open = ctx.broker.open_qty(&self.sym);
            self.exited_this_window = true;
            if open > 0 {
                let limit = round_to_tick(price - ctx.cfg.exit_offset, ctx.cfg.tick_size);
                self.place(Side::Sell, open, limit, tags::SELL_INPOS_IMMEDIATE_EXIT, ctx);
            }
            return;
        }

        let Some(sell_anchor) = self.saved_sell_ltp else {
            return;
        };
        let breakout_level = round_to_tick(sell_anchor + ctx.cfg.entry_offset, ctx.cfg.tick_size);
        if price > breakout_level {
            let forced = round_to_tick(sell_anchor + 1.0, ctx.cfg.tick_size);
            info!(sym = %self.sym, price, forced, "SELL window breakout, flipping to BUY");
            self.close_window(ctx);
            self.handle_buy(forced, Some((forced, tags::SELL_FLAT_BREAKOUT)), false, ctx);
        } else if let Some(start) = self.sell_start_anchor {
            if price < start {
                info!(sym = %self.sym, price, anchor = start, "SELL window discount re-entry");
                self.close_window(ctx);
                self.handle_buy(
                    start,
                    Some((start, tags::BUY_SIGNAL_FORCED_ANCHOR)),
                    false,
                    ctx,
                );
            }
        }
    }

    fn buy_window_tick(&mut self, price: f64, ctx: &mut MachineCtx<'_>) {
        let Some(anchor) = self.window_anchor else {
            return;
        };
        let open = ctx.broker.open_qty(&self.sym);

        let stop_level = round_to_tick(anchor - ctx.cfg.stop_loss_points, ctx.cfg.tick_size);
        if open > 0 && price < stop_level && !self.exited_this_window {
            let limit = round_to_tick(price - ctx.cfg.exit_offset, ctx.cfg.tick_size);
            info!(sym = %self.sym, price, anchor, limit, "stop-out");
            self.place(Side::Sell, open, limit, tags::BUY_WINDOW_STOP_OUT, ctx);
            self.exited_this_window = true;
            self.silenced_until_ms = Some(self.window_deadline_ms);
            self.reentry_check_armed = true;
            if let Some(sub) = self.tick_sub.take() {
                ctx.hub.unsubscribe(sub);
            }
            // the timer stays armed: the deadline still runs the flat
            // re-entry check and bounds the silencing
            self.state = MachineState::Idle;
        } else if open == 0 && price > anchor {
            let qty = match ctx.sizer.qty_for_entry(&self.sym, price, 0) {
                Ok(q) => q,
                Err(e) => {
                    warn!(sym = %self.sym, error = %e, "re-entry sizing failed, intent dropped");
                    return;
                }
            };
            let limit = round_to_tick(price + ctx.cfg.entry_offset, ctx.cfg.tick_size);
            info!(sym = %self.sym, price, anchor, limit, "breakout re-enter, window restarted");
            self.place(Side::Buy, qty, limit, tags::BUY_WINDOW_BREAKOUT_REENTER, ctx);
            self.close_window(ctx);
            self.window_anchor = Some(anchor);
            self.open_window(MachineState::InBuyWindow, ctx);
        }
    }

    // ------------------------------------------------------------------
    // Window expiry
    // ------------------------------------------------------------------

    pub fn on_window_expired(&mut self, cb_window_id: u64, ctx: &mut MachineCtx<'_>) {
        if cb_window_id != self.window_id {
            debug!(sym = %self.sym, cb_window_id, current = self.window_id, "stale window timer discarded");
            return;
        }
        self.window_timer = None;
        match self.state {
            MachineState::InSellWindow => {
                // Loop: restart on the current cached price, re-evaluating
                // whether a position is still open.
                let anchor = ctx.hub.last_price(&self.sym).or(self.saved_sell_ltp);
                self.saved_sell_ltp = anchor;
                info!(sym = %self.sym, ?anchor, "SELL window expired, restarting");
                self.open_window(MachineState::InSellWindow, ctx);
            }
            MachineState::InBuyWindow => {
                self.close_window(ctx);
                self.expiry_reentry_check(ctx);
            }
            MachineState::Idle => {
                if self.reentry_check_armed {
                    self.reentry_check_armed = false;
                    self.silenced_until_ms = None;
                    self.expiry_reentry_check(ctx);
                }
            }
        }
    }

    /// Deadline check for a BUY window: flat with the cached price above
    /// the anchor re-enters with the same anchor; anything else stays idle.
    fn expiry_reentry_check(&mut self, ctx: &mut MachineCtx<'_>) {
        let Some(anchor) = self.window_anchor else {
            return;
        };
        let open = ctx.broker.open_qty(&self.sym);
        let last = ctx.hub.last_price(&self.sym);
        if open == 0 {
            if let Some(last) = last {
                if last > anchor {
                    let qty = match ctx.sizer.qty_for_entry(&self.sym, last, 0) {
                        Ok(q) => q,
                        Err(e) => {
                            warn!(sym = %self.sym, error = %e, "expiry re-entry sizing failed");
                            return;
                        }
                    };
                    let limit = round_to_tick(last + ctx.cfg.entry_offset, ctx.cfg.tick_size);
                    info!(sym = %self.sym, last, anchor, limit, "expiry re-entry");
                    self.place(Side::Buy, qty, limit, tags::BUY_WINDOW_BREAKOUT_REENTER, ctx);
                    self.window_anchor = Some(anchor);
                    self.open_window(MachineState::InBuyWindow, ctx);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Window plumbing
    // ------------------------------------------------------------------

    fn open_window(&mut self, state: MachineState, ctx: &mut MachineCtx<'_>) {
        // cancel the previous window's timer and watcher before arming
        if let Some(timer) = self.window_timer.take() {
            ctx.timers.cancel(timer);
        }
        if let Some(sub) = self.tick_sub.take() {
            ctx.hub.unsubscribe(sub);
        }

        self.window_id += 1;
        self.window_deadline_ms = ctx.now_ms + ctx.cfg.window_ms;
        self.exited_this_window = false;
        self.reentry_check_armed = false;
        self.state = state;
        if state == MachineState::InSellWindow {
            self.window_had_pos = ctx.broker.open_qty(&self.sym) > 0;
        }

        self.window_timer = Some(ctx.timers.schedule(
            self.window_deadline_ms,
            TimerPayload::WindowExpired {
                sym: self.sym.clone(),
                window_id: self.window_id,
            },
        ));
        // The cached price returned here is observational only; the window
        // rules trigger on ticks ingested after the window opened.
        let (sub, _cached) = ctx.hub.subscribe(
            &self.sym,
            SubscriberId::Machine {
                sym: self.sym.clone(),
                window_id: self.window_id,
            },
        );
        self.tick_sub = Some(sub);
        debug!(sym = %self.sym, window_id = self.window_id, state = %self.state,
               deadline = self.window_deadline_ms, "window opened");
    }

    fn close_window(&mut self, ctx: &mut MachineCtx<'_>) {
        if let Some(timer) = self.window_timer.take() {
            ctx.timers.cancel(timer);
        }
        if let Some(sub) = self.tick_sub.take() {
            ctx.hub.unsubscribe(sub);
        }
        self.exited_this_window = false;
        self.state = MachineState::Idle;
    }

    fn place(&mut self, side: Side, qty: i64, limit: f64, tag: &'static str, ctx: &mut MachineCtx<'_>) {
        let cached = ctx.hub.last_price(&self.sym);
        let (order_id, fill) =
            ctx.broker
                .place_limit(&self.sym, side, qty, limit, tag, cached, ctx.now_ms);
        if fill.is_none() && side == Side::Buy {
            self.entry_order_id = Some(order_id);
            if let Some(ttl) = ctx.cfg.entry_ttl_ms {
                ctx.timers.schedule(
                    ctx.now_ms + ttl,
                    TimerPayload::EntryTtl {
                        sym: self.sym.clone(),
                        order_id,
                        window_id: self.window_id,
                    },
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot {
            sym: self.sym.clone(),
            state: self.state,
            window_id: self.window_id,
            window_ends_at_ms: self.window_deadline_ms,
            window_anchor: self.window_anchor,
            window_had_pos: self.window_had_pos,
            saved_buy_ltp: self.saved_buy_ltp,
            saved_last_buy_ltp: self.saved_last_buy_ltp,
            saved_sell_ltp: self.saved_sell_ltp,
            sell_start_anchor: self.sell_start_anchor,
            pending_buy_after_sell: self.pending_buy_after_sell,
            silenced_until_ms: self.silenced_until_ms,
            reentry_check_armed: self.reentry_check_armed,
            entry_order_id: self.entry_order_id,
        }
    }

    /// Re-hydrate coarse state. A window whose deadline is still in the
    /// future is re-armed (same id, original deadline), as is a stop-out's
    /// deferred re-entry check; an elapsed window collapses to idle and the
    /// next event proceeds from the anchors.
    pub fn restore(snap: MachineSnapshot, ctx: &mut MachineCtx<'_>) -> Self {
        let mut machine = Self::new(snap.sym.clone());
        machine.window_id = snap.window_id;
        machine.window_anchor = snap.window_anchor;
        machine.window_had_pos = snap.window_had_pos;
        machine.saved_buy_ltp = snap.saved_buy_ltp;
        machine.saved_last_buy_ltp = snap.saved_last_buy_ltp;
        machine.saved_sell_ltp = snap.saved_sell_ltp;
        machine.sell_start_anchor = snap.sell_start_anchor;
        machine.pending_buy_after_sell = snap.pending_buy_after_sell;
        machine.silenced_until_ms = snap.silenced_until_ms;
        machine.entry_order_id = snap.entry_order_id;

        let deadline_pending = snap.window_ends_at_ms > ctx.now_ms;
        if snap.state != MachineState::Idle && deadline_pending {
            machine.state = snap.state;
            machine.window_deadline_ms = snap.window_ends_at_ms;
            machine.window_timer = Some(ctx.timers.schedule(
                snap.window_ends_at_ms,
                TimerPayload::WindowExpired {
                    sym: machine.sym.clone(),
                    window_id: machine.window_id,
                },
            ));
            let (sub, _) = ctx.hub.subscribe(
                &machine.sym,
                SubscriberId::Machine {
                    sym: machine.sym.clone(),
                    window_id: machine.window_id,
                },
            );
            machine.tick_sub = Some(sub);
        } else if snap.state == MachineState::Idle && snap.reentry_check_armed && deadline_pending {
            // A stop-out was waiting out its window when the process went
            // down: re-arm the deadline so the flat re-entry check still
            // runs. The tick watcher stays down, as it was after the exit.
            machine.reentry_check_armed = true;
            machine.window_deadline_ms = snap.window_ends_at_ms;
            machine.window_timer = Some(ctx.timers.schedule(
                snap.window_ends_at_ms,
                TimerPayload::WindowExpired {
                    sym: machine.sym.clone(),
                    window_id: machine.window_id,
                },
            ));
        }
        machine
    }
}
