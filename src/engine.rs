//! Single-threaded executor owning the machine registry, tick hub, paper
//! broker, and timer service.
//!
//! Every event — tick delivery, timer firing, signal dispatch — runs to
//! completion here before the next is observed, so machine transitions
//! never race and follow-up orders observe the state their trigger left
//! behind. External I/O lives elsewhere; the only ways in are tick
//! ingestion and signal submission, and the only ways out are copy-out
//! snapshots.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::broker::{CancelResult, PaperBroker, PnlReport, TradeRecord};
use crate::clock::{EngineClock, EpochMs, TimerPayload, TimerService};
use crate::config::{EngineConfig, MissingPricePolicy};
use crate::error::EngineError;
use crate::hours::MarketHours;
use crate::hub::{SubscriberId, TickHub};
use crate::machine::{MachineCtx, MachineSnapshot, MachineState, SymbolMachine};
use crate::persist;
use crate::router::{self, SignalOutcome};
use crate::sizing::Sizer;
use crate::tradelog::TradeLogger;
use crate::types::{Side, Signal, Sym};

pub struct Engine {
    cfg: EngineConfig,
    clock: EngineClock,
    timers: TimerService,
    hub: TickHub,
    broker: PaperBroker,
    sizer: Sizer,
    hours: MarketHours,
    machines: HashMap<Sym, SymbolMachine>,
    broker_subscribed: HashSet<Sym>,
    parked: HashMap<u64, Signal>,
    next_seq: u64,
    trade_logger: Option<TradeLogger>,
    trades_logged: usize,
}

impl Engine {
    pub fn new(cfg: EngineConfig, clock: EngineClock) -> Result<Self> {
        let hours = cfg.market_hours()?;
        let sizer = cfg.sizer();
        let broker = PaperBroker::new(cfg.brokerage);
        let trade_logger = match &cfg.trade_log_path {
            Some(path) => Some(TradeLogger::new(path)?),
            None => None,
        };

        let mut engine = Self {
            cfg,
            clock,
            timers: TimerService::new(),
            hub: TickHub::new(),
            broker,
            sizer,
            hours,
            machines: HashMap::new(),
            broker_subscribed: HashSet::new(),
            parked: HashMap::new(),
            next_seq: 0,
            trade_logger,
            trades_logged: 0,
        };

        if let Some(path) = engine.cfg.state_path.clone() {
            if path.exists() {
                match persist::load(&path) {
                    Ok(snaps) => engine.hydrate(snaps),
                    Err(e) => warn!(error = %e, "failed to load machine snapshots"),
                }
            }
        }
        Ok(engine)
    }

    pub fn now_ms(&self) -> EpochMs {
        self.clock.now_ms()
    }

    pub fn broker(&self) -> &PaperBroker {
        &self.broker
    }

    pub fn machine_state(&self, sym: &Sym) -> Option<MachineState> {
        self.machines.get(sym).map(|m| m.state())
    }

    pub fn machine_snapshot(&self, sym: &Sym) -> Option<MachineSnapshot> {
        self.machines.get(sym).map(|m| m.snapshot())
    }

    pub fn pnl(&self) -> PnlReport {
        self.broker.pnl(|sym| self.hub.last_price(sym))
    }

    pub fn trades(&self) -> Vec<TradeRecord> {
        self.broker.trades().to_vec()
    }

    pub fn last_price(&self, sym: &Sym) -> Option<f64> {
        self.hub.last_price(sym)
    }

    /// Restore coarse machine state saved by a previous run.
    pub fn hydrate(&mut self, snaps: Vec<MachineSnapshot>) {
        for snap in snaps {
            let sym = snap.sym.clone();
            self.ensure_broker_sub(&sym);
            let now_ms = self.clock.now_ms();
            let mut ctx = MachineCtx {
                now_ms,
                timers: &mut self.timers,
                hub: &mut self.hub,
                broker: &mut self.broker,
                sizer: &self.sizer,
                cfg: &self.cfg,
            };
            let machine = SymbolMachine::restore(snap, &mut ctx);
            info!(%sym, state = %machine.state(), "machine re-hydrated");
            self.machines.insert(sym, machine);
        }
    }

    // ------------------------------------------------------------------
    // Event intake
    // ------------------------------------------------------------------

    /// Feed one last-traded-price update through the hub to the broker's
    /// fill pass and every armed window watcher, then resolve any parked
    /// signals waiting on a first price.
    pub fn ingest_tick(&mut self, sym: &Sym, price: f64, ts_ms: EpochMs) {
        if !(price.is_finite() && price > 0.0) {
            warn!(%sym, price, "non-positive tick dropped");
            return;
        }
        self.ensure_broker_sub(sym);
        let deliveries = self.hub.ingest(sym, price, ts_ms);
        for delivery in deliveries {
            match delivery.target {
                SubscriberId::Broker => {
                    self.broker.on_tick(sym, price, ts_ms);
                }
                SubscriberId::Machine { sym, window_id } => {
                    self.with_machine(&sym, |machine, ctx| machine.on_tick(price, window_id, ctx));
                }
            }
        }
        self.resolve_parked(sym, price);
        self.after_event();
    }

    /// Submit a structured signal.
    pub fn submit_signal(&mut self, signal: Signal) -> Result<SignalOutcome, EngineError> {
        router::validate(&signal)?;

        if !self.cfg.allow_after_hours {
            let at = DateTime::<Utc>::from_timestamp_millis(self.clock.now_ms() as i64)
                .unwrap_or_else(Utc::now);
            if !self.hours.is_open(at) {
                info!(sym = %signal.sym, side = %signal.side, "signal ignored, market closed");
                return Ok(SignalOutcome::Ignored {
                    reason: "market closed".to_string(),
                });
            }
        }

        // The signal's own price wins when a tick has been seen; with no
        // tick yet the missing-price policy decides.
        let price = if let Some(last) = self.hub.last_price(&signal.sym) {
            signal.at_price.unwrap_or(last)
        } else {
            match self.cfg.missing_price {
                MissingPricePolicy::UseSeed => match signal.at_price {
                    Some(seed) => seed,
                    None => return Err(EngineError::NoPriceAvailable(signal.sym)),
                },
                MissingPricePolicy::WaitThenSeed { timeout_ms } => {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    self.timers.schedule(
                        self.clock.now_ms() + timeout_ms,
                        TimerPayload::SignalTimeout {
                            sym: signal.sym.clone(),
                            seq,
                        },
                    );
                    info!(sym = %signal.sym, seq, "signal parked awaiting first tick");
                    self.parked.insert(seq, signal);
                    return Ok(SignalOutcome::Deferred);
                }
                MissingPricePolicy::Fail => {
                    return Err(EngineError::NoPriceAvailable(signal.sym))
                }
            }
        };

        self.dispatch(&signal.sym, signal.side, price);
        self.after_event();
        Ok(SignalOutcome::Dispatched)
    }

    /// Submit a raw webhook-style text payload.
    pub fn submit_raw(&mut self, text: &str) -> Result<SignalOutcome, EngineError> {
        let signal = router::parse_raw(text, self.clock.now_ms())?;
        self.submit_signal(signal)
    }

    // ------------------------------------------------------------------
    // Time
    // ------------------------------------------------------------------

    /// Earliest outstanding timer deadline.
    pub fn next_deadline(&mut self) -> Option<EpochMs> {
        self.timers.next_deadline()
    }

    /// Fire every timer due at the current clock reading. The live runner
    /// calls this after sleeping to the next deadline.
    pub fn fire_due(&mut self) {
        loop {
            let now = self.clock.now_ms();
            let Some((_, payload)) = self.timers.pop_due(now) else {
                break;
            };
            self.dispatch_timer(payload);
        }
        self.after_event();
    }

    /// Advance a virtual clock to `ms`, firing each expired timer at its
    /// own deadline on the way, in schedule order.
    pub fn advance_to(&mut self, ms: EpochMs) {
        while let Some(deadline) = self.timers.next_deadline() {
            if deadline > ms {
                break;
            }
            self.clock.set_ms(deadline);
            if let Some((_, payload)) = self.timers.pop_due(deadline) {
                self.dispatch_timer(payload);
            }
        }
        self.clock.set_ms(ms);
        self.after_event();
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn dispatch(&mut self, sym: &Sym, side: Side, price: f64) {
        self.ensure_broker_sub(sym);
        self.with_machine(sym, |machine, ctx| machine.on_signal(side, price, ctx));
    }

    fn dispatch_timer(&mut self, payload: TimerPayload) {
        match payload {
            TimerPayload::WindowExpired { sym, window_id } => {
                self.with_machine(&sym, |machine, ctx| {
                    machine.on_window_expired(window_id, ctx)
                });
            }
            TimerPayload::SignalTimeout { sym, seq } => {
                if let Some(signal) = self.parked.remove(&seq) {
                    match signal.at_price {
                        Some(price) => {
                            info!(%sym, seq, "parked signal timed out, using seed price");
                            self.dispatch(&sym, signal.side, price);
                        }
                        None => {
                            warn!(%sym, seq, "parked signal timed out with no seed, dropped");
                        }
                    }
                }
            }
            TimerPayload::EntryTtl { sym, order_id, .. } => {
                match self.broker.cancel(order_id) {
                    CancelResult::Cancelled => {
                        info!(%sym, %order_id, "pending entry outlived its TTL, cancelled")
                    }
                    // ambiguous with a fill; the position keeper already
                    // reflects whichever happened
                    CancelResult::NotPending => {
                        debug!(%sym, %order_id, "entry TTL fired for a settled order")
                    }
                }
            }
        }
    }

    fn with_machine<R>(
        &mut self,
        sym: &Sym,
        f: impl FnOnce(&mut SymbolMachine, &mut MachineCtx<'_>) -> R,
    ) -> R {
        let mut machine = self
            .machines
            .remove(sym)
            .unwrap_or_else(|| SymbolMachine::new(sym.clone()));
        let now_ms = self.clock.now_ms();
        let mut ctx = MachineCtx {
            now_ms,
            timers: &mut self.timers,
            hub: &mut self.hub,
            broker: &mut self.broker,
            sizer: &self.sizer,
            cfg: &self.cfg,
        };
        let result = f(&mut machine, &mut ctx);
        self.machines.insert(sym.clone(), machine);
        result
    }

    fn ensure_broker_sub(&mut self, sym: &Sym) {
        if self.broker_subscribed.insert(sym.clone()) {
            // the fill pass subscribes ahead of any machine watcher so a
            // tick's fills are visible to the rules it triggers
            self.hub.subscribe(sym, SubscriberId::Broker);
        }
    }

    fn resolve_parked(&mut self, sym: &Sym, price: f64) {
        let mut due: Vec<u64> = self
            .parked
            .iter()
            .filter(|(_, s)| &s.sym == sym)
            .map(|(&seq, _)| seq)
            .collect();
        due.sort_unstable(); // submission order
        for seq in due {
            if let Some(signal) = self.parked.remove(&seq) {
                info!(%sym, seq, price, "parked signal resolved by first tick");
                self.dispatch(sym, signal.side, signal.at_price.unwrap_or(price));
            }
        }
    }

    /// Flush fills to the CSV log and persist machine snapshots after each
    /// completed event.
    fn after_event(&mut self) {
        if let Some(logger) = &mut self.trade_logger {
            for trade in &self.broker.trades()[self.trades_logged..] {
                logger.log(trade);
            }
        }
        self.trades_logged = self.broker.trades().len();

        if let Some(path) = &self.cfg.state_path {
            let mut snaps: Vec<MachineSnapshot> =
                self.machines.values().map(|m| m.snapshot()).collect();
            snaps.sort_by(|a, b| a.sym.cmp(&b.sym));
            if let Err(e) = persist::save(path, &snaps) {
                warn!(error = %e, "failed to persist machine snapshots");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokeragePolicy;
    use crate::types::{tags, Side};

    fn sym() -> Sym {
        Sym::from("NIFTY2580722000CE")
    }

    fn test_engine(capital: f64) -> Engine {
        let cfg = EngineConfig {
            capital,
            allow_after_hours: true,
            brokerage: BrokeragePolicy::PerTradeRate { rate: 0.0 },
            ..Default::default()
        };
        Engine::new(cfg, EngineClock::virtual_at(0)).unwrap()
    }

    fn buy(ts_ms: EpochMs, at_price: f64) -> Signal {
        Signal {
            sym: sym(),
            side: Side::Buy,
            ts_ms,
            at_price: Some(at_price),
            reason: None,
        }
    }

    fn sell(ts_ms: EpochMs, at_price: f64) -> Signal {
        Signal {
            sym: sym(),
            side: Side::Sell,
            ts_ms,
            at_price: Some(at_price),
            reason: None,
        }
    }

    #[test]
    fn test_buy_then_breakout_reenter() {
        // A tick above the anchor while flat re-enters and
        // restarts the window.
        let mut e = test_engine(10_000.0);
        e.submit_signal(buy(0, 100.0)).unwrap();
        // entry is pending: no tick has been seen yet
        assert!(e.trades().is_empty());
        assert_eq!(e.machine_state(&sym()), Some(MachineState::InBuyWindow));

        e.advance_to(5_000);
        e.ingest_tick(&sym(), 101.0, 5_000);

        let trades = e.trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].side, Side::Buy);
        assert_eq!(trades[0].qty, 75);
        assert_eq!(trades[0].price, 101.5);
        assert_eq!(trades[0].tag, tags::BUY_WINDOW_BREAKOUT_REENTER);
        // fresh window expires 60s after the re-entry tick
        assert_eq!(e.machine_snapshot(&sym()).unwrap().window_ends_at_ms, 65_000);
    }

    #[test]
    fn test_stop_out_then_silenced_then_accepted() {
        // A stop-out flattens, silences until the deadline,
        // and the next BUY after the deadline is accepted.
        let mut e = test_engine(10_000.0);
        e.submit_signal(buy(0, 100.0)).unwrap();

        e.advance_to(10_000);
        e.ingest_tick(&sym(), 99.0, 10_000);

        let trades = e.trades();
        assert_eq!(trades.len(), 2);
        // entry fills first (99 crosses the 100.50 limit), then the machine
        // sees the same tick below the defended anchor and stops out
        assert_eq!(trades[0].price, 100.5);
        assert_eq!(trades[1].side, Side::Sell);
        assert_eq!(trades[1].qty, 75);
        assert_eq!(trades[1].price, 98.5);
        assert_eq!(trades[1].tag, tags::BUY_WINDOW_STOP_OUT);
        assert_eq!(e.broker().open_qty(&sym()), 0);
        assert_eq!(e.machine_state(&sym()), Some(MachineState::Idle));
        assert_eq!(e.machine_snapshot(&sym()).unwrap().silenced_until_ms, Some(60_000));
        assert!(e.machine_snapshot(&sym()).unwrap().reentry_check_armed);

        // silenced: a BUY mid-window goes nowhere
        e.advance_to(30_000);
        e.submit_signal(buy(30_000, 99.5)).unwrap();
        assert_eq!(e.trades().len(), 2);

        // past the deadline: accepted (99 is not above the old anchor, so
        // no auto re-entry happened at expiry)
        e.advance_to(61_000);
        e.submit_signal(buy(61_000, 99.0)).unwrap();
        let trades = e.trades();
        assert_eq!(trades.len(), 3);
        assert_eq!(trades[2].tag, tags::BUY_SIGNAL_PREWINDOW);
        assert_eq!(trades[2].price, 99.5);
    }

    #[test]
    fn test_at_most_one_exit_per_window() {
        let mut e = test_engine(10_000.0);
        e.submit_signal(buy(0, 100.0)).unwrap();
        e.ingest_tick(&sym(), 99.0, 1_000); // entry fill + stop-out
        assert_eq!(e.trades().len(), 2);

        // further collapsing ticks in the same window produce nothing
        e.ingest_tick(&sym(), 98.0, 2_000);
        e.ingest_tick(&sym(), 97.0, 3_000);
        assert_eq!(e.trades().len(), 2);
    }

    #[test]
    fn test_sell_in_position_immediate_exit_then_loop() {
        // No-flip exit on the first tick after SELL, quiet
        // for the rest of the window, then the SELL window loops.
        let mut e = test_engine(10_000.0);
        e.ingest_tick(&sym(), 100.0, 0);
        e.submit_signal(buy(0, 100.0)).unwrap(); // fills 75 @ 100.50
        assert_eq!(e.broker().open_qty(&sym()), 75);

        e.advance_to(1_000);
        e.submit_signal(sell(1_000, 103.0)).unwrap();
        assert_eq!(e.machine_state(&sym()), Some(MachineState::InSellWindow));

        e.advance_to(2_000);
        e.ingest_tick(&sym(), 103.2, 2_000);
        let trades = e.trades();
        assert_eq!(trades.last().unwrap().side, Side::Sell);
        assert_eq!(trades.last().unwrap().qty, 75); // exactly the open size
        assert_eq!(trades.last().unwrap().price, 102.7);
        assert_eq!(trades.last().unwrap().tag, tags::SELL_INPOS_IMMEDIATE_EXIT);
        assert_eq!(e.broker().open_qty(&sym()), 0);

        // later ticks in the window are ignored
        let count = e.trades().len();
        e.ingest_tick(&sym(), 104.0, 3_000);
        assert_eq!(e.trades().len(), count);

        // at the deadline the SELL window restarts, now flat, anchored on
        // the cached price
        e.advance_to(61_500);
        let snap = e.machine_snapshot(&sym()).unwrap();
        assert_eq!(snap.state, MachineState::InSellWindow);
        assert_eq!(snap.window_ends_at_ms, 121_000);
        assert_eq!(snap.saved_sell_ltp, Some(104.0));
        assert!(!snap.window_had_pos);
    }

    #[test]
    fn test_sell_flat_breakout_flips_to_buy() {
        // A tick above the SELL anchor + offset flips into a
        // BUY window with a forced anchor one point above the SELL anchor.
        let mut e = test_engine(10_000.0);
        e.submit_signal(sell(0, 50.0)).unwrap();
        assert_eq!(e.machine_state(&sym()), Some(MachineState::InSellWindow));

        e.advance_to(5_000);
        e.ingest_tick(&sym(), 50.6, 5_000);

        let snap = e.machine_snapshot(&sym()).unwrap();
        assert_eq!(snap.state, MachineState::InBuyWindow);
        assert_eq!(snap.saved_buy_ltp, Some(51.0));
        // the flip is not a signal: the post-SELL entry cycle is still
        // waiting for a genuine BUY
        assert!(snap.pending_buy_after_sell);
        assert_eq!(snap.sell_start_anchor, None);

        let trades = e.trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].side, Side::Buy);
        assert_eq!(trades[0].price, 51.5);
        assert_eq!(trades[0].tag, tags::SELL_FLAT_BREAKOUT);

        // the next genuine BUY signal records its own price as the cycle
        // anchor and leaves the running window intact
        e.advance_to(10_000);
        e.submit_signal(buy(10_000, 52.0)).unwrap();
        let snap = e.machine_snapshot(&sym()).unwrap();
        assert_eq!(snap.sell_start_anchor, Some(52.0));
        assert!(!snap.pending_buy_after_sell);
        assert_eq!(snap.state, MachineState::InBuyWindow);
    }

    #[test]
    fn test_sell_flat_discount_reentry() {
        // Flat with a recorded entry-cycle anchor; a tick
        // below it re-enters at that anchor.
        let mut e = test_engine(10_000.0);
        let mut snap = SymbolMachine::new(sym()).snapshot();
        snap.sell_start_anchor = Some(100.0);
        e.hydrate(vec![snap]);

        e.submit_signal(sell(0, 99.0)).unwrap();
        e.advance_to(3_000);
        e.ingest_tick(&sym(), 98.5, 3_000);

        let snap = e.machine_snapshot(&sym()).unwrap();
        assert_eq!(snap.state, MachineState::InBuyWindow);
        assert_eq!(snap.saved_buy_ltp, Some(100.0));
        // the flip preserves the cycle anchor and flag for a real signal
        assert_eq!(snap.sell_start_anchor, Some(100.0));
        assert!(snap.pending_buy_after_sell);

        let trades = e.trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].price, 100.5);
        assert_eq!(trades[0].tag, tags::BUY_SIGNAL_FORCED_ANCHOR);
    }

    #[test]
    fn test_expiry_reentry_when_price_above_anchor() {
        // A stopped-out window still runs the flat re-entry check at its
        // original deadline: flat with the cached price above the anchor
        // re-enters and arms a fresh window.
        let mut e = test_engine(10_000.0);
        e.ingest_tick(&sym(), 100.0, 0);
        e.submit_signal(buy(0, 100.0)).unwrap(); // fills 75 @ 100.50
        e.ingest_tick(&sym(), 99.0, 1_000); // stop-out, silenced to t=60s
        assert_eq!(e.trades().len(), 2);
        assert_eq!(e.machine_state(&sym()), Some(MachineState::Idle));

        // the cache keeps moving while the machine sits out the window
        e.ingest_tick(&sym(), 101.0, 2_000);
        assert_eq!(e.trades().len(), 2);

        e.advance_to(60_000);
        let trades = e.trades();
        assert_eq!(trades.len(), 3);
        assert_eq!(trades[2].side, Side::Buy);
        assert_eq!(trades[2].price, 101.5);
        assert_eq!(trades[2].tag, tags::BUY_WINDOW_BREAKOUT_REENTER);
        let snap = e.machine_snapshot(&sym()).unwrap();
        assert_eq!(snap.state, MachineState::InBuyWindow);
        assert_eq!(snap.window_ends_at_ms, 120_000);
    }

    #[test]
    fn test_restart_during_silencing_keeps_reentry_check() {
        // A restart while a stop-out is waiting out its window must not
        // drop the deadline's flat re-entry check.
        let mut a = test_engine(10_000.0);
        a.ingest_tick(&sym(), 100.0, 0);
        a.submit_signal(buy(0, 100.0)).unwrap(); // fills 75 @ 100.50
        a.ingest_tick(&sym(), 99.0, 1_000); // stop-out, armed until t=60s
        let snap = a.machine_snapshot(&sym()).unwrap();
        assert!(snap.reentry_check_armed);

        // fresh process, clock inside the silenced window
        let cfg = EngineConfig {
            capital: 10_000.0,
            allow_after_hours: true,
            brokerage: BrokeragePolicy::PerTradeRate { rate: 0.0 },
            ..Default::default()
        };
        let mut b = Engine::new(cfg, EngineClock::virtual_at(30_000)).unwrap();
        b.hydrate(vec![snap]);
        b.ingest_tick(&sym(), 101.0, 30_500);

        // still silenced until the original deadline
        b.submit_signal(buy(31_000, 101.0)).unwrap();
        assert!(b.trades().is_empty());

        // at the deadline the re-armed check fires: flat, 101 > anchor 100
        b.advance_to(60_000);
        let trades = b.trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].price, 101.5);
        assert_eq!(trades[0].tag, tags::BUY_WINDOW_BREAKOUT_REENTER);
        let snap = b.machine_snapshot(&sym()).unwrap();
        assert_eq!(snap.state, MachineState::InBuyWindow);
        assert_eq!(snap.window_ends_at_ms, 120_000);
    }

    #[test]
    fn test_wait_then_seed_resolves_on_first_tick() {
        let cfg = EngineConfig {
            capital: 10_000.0,
            allow_after_hours: true,
            brokerage: BrokeragePolicy::PerTradeRate { rate: 0.0 },
            missing_price: MissingPricePolicy::WaitThenSeed { timeout_ms: 2_000 },
            ..Default::default()
        };
        let mut e = Engine::new(cfg, EngineClock::virtual_at(0)).unwrap();

        let signal = Signal {
            sym: sym(),
            side: Side::Buy,
            ts_ms: 0,
            at_price: None,
            reason: None,
        };
        let outcome = e.submit_signal(signal).unwrap();
        assert_eq!(outcome, SignalOutcome::Deferred);
        assert!(e.machine_state(&sym()).is_none());

        e.advance_to(1_000);
        e.ingest_tick(&sym(), 100.0, 1_000);
        // parked signal dispatched with the live price; entry fills at the
        // cached tick
        assert_eq!(e.trades().len(), 1);
        assert_eq!(e.trades()[0].price, 100.5);
        assert_eq!(e.machine_state(&sym()), Some(MachineState::InBuyWindow));
    }

    #[test]
    fn test_wait_then_seed_timeout_without_seed_drops() {
        let cfg = EngineConfig {
            allow_after_hours: true,
            missing_price: MissingPricePolicy::WaitThenSeed { timeout_ms: 2_000 },
            ..Default::default()
        };
        let mut e = Engine::new(cfg, EngineClock::virtual_at(0)).unwrap();
        let signal = Signal {
            sym: sym(),
            side: Side::Buy,
            ts_ms: 0,
            at_price: None,
            reason: None,
        };
        assert_eq!(e.submit_signal(signal).unwrap(), SignalOutcome::Deferred);
        e.advance_to(5_000);
        assert!(e.trades().is_empty());
        assert!(e.machine_state(&sym()).is_none());
    }

    #[test]
    fn test_no_price_and_no_seed_fails_under_use_seed() {
        let mut e = test_engine(10_000.0);
        let signal = Signal {
            sym: sym(),
            side: Side::Buy,
            ts_ms: 0,
            at_price: None,
            reason: None,
        };
        let err = e.submit_signal(signal).unwrap_err();
        assert!(matches!(err, EngineError::NoPriceAvailable(_)));
    }

    #[test]
    fn test_market_closed_ignores() {
        // virtual epoch 0 is 1970-01-01 05:30 IST, well outside the session
        let cfg = EngineConfig {
            allow_after_hours: false,
            ..Default::default()
        };
        let mut e = Engine::new(cfg, EngineClock::virtual_at(0)).unwrap();
        let outcome = e.submit_signal(buy(0, 100.0)).unwrap();
        assert_eq!(
            outcome,
            SignalOutcome::Ignored {
                reason: "market closed".to_string()
            }
        );
        assert!(e.machine_state(&sym()).is_none());
    }

    #[test]
    fn test_raw_payload_end_to_end() {
        let mut e = test_engine(10_000.0);
        e.ingest_tick(&sym(), 100.0, 0);
        let outcome = e
            .submit_raw("BUY sym=NIFTY2580722000CE stopPx=100.0")
            .unwrap();
        assert_eq!(outcome, SignalOutcome::Dispatched);
        assert_eq!(e.trades().len(), 1);
        assert_eq!(e.trades()[0].price, 100.5);
    }

    #[test]
    fn test_buy_during_sell_window_records_cycle_anchor() {
        // the first BUY after a SELL adopts the signal price as the cycle
        // anchor and leaves the SELL window running
        let mut e = test_engine(10_000.0);
        e.submit_signal(sell(0, 100.0)).unwrap();
        e.advance_to(1_000);
        e.submit_signal(buy(1_000, 100.0)).unwrap();

        let snap = e.machine_snapshot(&sym()).unwrap();
        assert_eq!(snap.state, MachineState::InSellWindow);
        assert_eq!(snap.sell_start_anchor, Some(100.0));
        assert!(!snap.pending_buy_after_sell);
    }

    #[test]
    fn test_entry_ttl_cancels_stale_entry() {
        let cfg = EngineConfig {
            capital: 10_000.0,
            allow_after_hours: true,
            entry_ttl_ms: Some(5_000),
            brokerage: BrokeragePolicy::PerTradeRate { rate: 0.0 },
            ..Default::default()
        };
        let mut e = Engine::new(cfg, EngineClock::virtual_at(0)).unwrap();
        e.submit_signal(buy(0, 100.0)).unwrap(); // pending, no tick yet
        let order_id = e.machine_snapshot(&sym()).unwrap().entry_order_id.unwrap();

        e.advance_to(6_000);
        use crate::broker::OrderStatus;
        assert_eq!(e.broker().status(order_id), Some(OrderStatus::Cancelled));
        // a crossing tick later must not fill the cancelled entry
        e.ingest_tick(&sym(), 99.0, 7_000);
        assert!(e.trades().iter().all(|t| t.side != Side::Buy || t.price != 100.5));
    }

    #[test]
    fn test_position_invariants_hold() {
        let mut e = test_engine(10_000.0);
        e.ingest_tick(&sym(), 100.0, 0);
        e.submit_signal(buy(0, 100.0)).unwrap();
        e.ingest_tick(&sym(), 99.0, 1_000); // stop-out

        let pos = e.broker().position(&sym());
        assert_eq!(pos.qty, 0);
        assert_eq!(pos.avg_price, 0.0);

        let report = e.pnl();
        let sum: f64 = e.trades().iter().map(|t| t.realized_delta).sum();
        assert!((sum - report.realized_gross).abs() < 1e-9);
    }
}
