//! Tick hub: last-price cache and per-instrument fan-out.
//!
//! Subscribers are routable targets rather than closures; `ingest` returns
//! the delivery snapshot (taken at event start, in subscription order) and
//! the engine routes each delivery. A handler therefore never re-enters the
//! hub for the same tick, and unsubscribing mid-delivery cannot mutate the
//! snapshot already taken.

use std::collections::HashMap;

use tracing::debug;

use crate::clock::EpochMs;
use crate::types::Sym;

/// Who a subscription belongs to. The engine routes deliveries to the
/// matching component; the machine variant carries the window id it was
/// armed under so late deliveries can be discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberId {
    /// The paper broker's pending-order fill pass.
    Broker,
    /// A symbol machine's window watcher.
    Machine { sym: Sym, window_id: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubId(u64);

#[derive(Debug, Clone)]
struct SubEntry {
    id: SubId,
    target: SubscriberId,
}

/// One routed tick delivery.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub target: SubscriberId,
    pub price: f64,
    pub ts_ms: EpochMs,
}

#[derive(Debug, Default)]
pub struct TickHub {
    cache: HashMap<Sym, (f64, EpochMs)>,
    subs: HashMap<Sym, Vec<SubEntry>>,
    sub_sym: HashMap<SubId, Sym>,
    next_id: u64,
}

impl TickHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the cache, then snapshot the subscriber list for delivery.
    ///
    /// A `ts_ms` older than the cached one keeps the cache timestamp
    /// monotone but still overwrites the price and delivers; feeds re-send
    /// on reconnect and the downstream rules are price-driven.
    pub fn ingest(&mut self, sym: &Sym, price: f64, ts_ms: EpochMs) -> Vec<Delivery> {
        let entry = self.cache.entry(sym.clone()).or_insert((price, ts_ms));
        if ts_ms < entry.1 {
            debug!(%sym, ts_ms, cached_ts = entry.1, "tick timestamp regression");
            *entry = (price, entry.1);
        } else {
            *entry = (price, ts_ms);
        }
        let ts_ms = entry.1;

        self.subs
            .get(sym)
            .map(|list| {
                list.iter()
                    .map(|e| Delivery {
                        target: e.target.clone(),
                        price,
                        ts_ms,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn last_price(&self, sym: &Sym) -> Option<f64> {
        self.cache.get(sym).map(|&(p, _)| p)
    }

    pub fn last_tick(&self, sym: &Sym) -> Option<(f64, EpochMs)> {
        self.cache.get(sym).copied()
    }

    /// Register a subscriber. The cached value, if any, is returned so the
    /// caller can observe it synchronously once; subsequent ingests deliver
    /// through the snapshot.
    pub fn subscribe(&mut self, sym: &Sym, target: SubscriberId) -> (SubId, Option<(f64, EpochMs)>) {
        let id = SubId(self.next_id);
        self.next_id += 1;
        self.subs
            .entry(sym.clone())
            .or_default()
            .push(SubEntry { id, target });
        self.sub_sym.insert(id, sym.clone());
        (id, self.cache.get(sym).copied())
    }

    /// Idempotent.
    pub fn unsubscribe(&mut self, id: SubId) {
        if let Some(sym) = self.sub_sym.remove(&id) {
            if let Some(list) = self.subs.get_mut(&sym) {
                list.retain(|e| e.id != id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_and_overwrite() {
        let mut hub = TickHub::new();
        let sym = Sym::from("NIFTY");
        assert_eq!(hub.last_price(&sym), None);
        hub.ingest(&sym, 100.0, 10);
        hub.ingest(&sym, 101.0, 10); // duplicate ts: later value wins
        assert_eq!(hub.last_tick(&sym), Some((101.0, 10)));
    }

    #[test]
    fn test_ts_regression_keeps_monotone_ts() {
        let mut hub = TickHub::new();
        let sym = Sym::from("NIFTY");
        hub.ingest(&sym, 100.0, 100);
        hub.ingest(&sym, 99.0, 50);
        assert_eq!(hub.last_tick(&sym), Some((99.0, 100)));
    }

    #[test]
    fn test_delivery_in_subscription_order() {
        let mut hub = TickHub::new();
        let sym = Sym::from("NIFTY");
        hub.subscribe(&sym, SubscriberId::Broker);
        hub.subscribe(
            &sym,
            SubscriberId::Machine {
                sym: sym.clone(),
                window_id: 1,
            },
        );

        let deliveries = hub.ingest(&sym, 100.0, 1);
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].target, SubscriberId::Broker);
        assert!(matches!(
            deliveries[1].target,
            SubscriberId::Machine { window_id: 1, .. }
        ));
    }

    #[test]
    fn test_subscribe_returns_cached_once() {
        let mut hub = TickHub::new();
        let sym = Sym::from("NIFTY");
        hub.ingest(&sym, 100.0, 5);
        let (_, cached) = hub.subscribe(&sym, SubscriberId::Broker);
        assert_eq!(cached, Some((100.0, 5)));
    }

    #[test]
    fn test_unsubscribe_idempotent() {
        let mut hub = TickHub::new();
        let sym = Sym::from("NIFTY");
        let (id, _) = hub.subscribe(&sym, SubscriberId::Broker);
        hub.unsubscribe(id);
        hub.unsubscribe(id);
        assert!(hub.ingest(&sym, 100.0, 1).is_empty());
    }

    #[test]
    fn test_per_sym_isolation() {
        let mut hub = TickHub::new();
        let a = Sym::from("NIFTY");
        let b = Sym::from("BANKNIFTY");
        hub.subscribe(&a, SubscriberId::Broker);
        assert!(hub.ingest(&b, 42.0, 1).is_empty());
        assert_eq!(hub.last_price(&a), None);
    }
}
