//! Statistics bus (§4.H): synchronous fan-out of lifecycle/measurement/update events.
//!
//! Grounded on the `emit_ptp_statistics`/`domain_stats_n_hooks` machinery in the original
//! GStreamer PTP clock source and on SPEC_FULL.md §9's "async fan-out with mutation-during-
//! iteration" re-architecture note: subscribers may detach themselves from inside their own
//! callback, so removal is deferred until the fan-out loop returns rather than mutating the
//! subscriber list mid-iteration.

use std::sync::Mutex;

use super::identity::ClockIdentity;
use super::timestamp::Nanos;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PtpStatisticsEvent {
    NewDomainFound {
        domain: u8,
    },
    BestMasterClockSelected {
        domain: u8,
        master: ClockIdentity,
        grandmaster_identity: u64,
    },
    PathDelayMeasured {
        domain: u8,
        mean_path_delay_avg: Nanos,
        mean_path_delay: Nanos,
        delay_request_delay: Nanos,
    },
    TimeUpdated {
        domain: u8,
        mean_path_delay_avg: Nanos,
        local_time: Nanos,
        ptp_time: Nanos,
        estimated_ptp_time: Nanos,
        discontinuity: Nanos,
        synced: bool,
        r_squared: f64,
        internal_time: Nanos,
        external_time: Nanos,
        rate_num: i64,
        rate_den: i64,
        rate: f64,
    },
}

pub type HookId = u64;

/// A subscriber returns `false` from its callback to detach itself (§4.H).
type Hook = Box<dyn FnMut(&PtpStatisticsEvent) -> bool + Send>;

struct Subscription {
    id: HookId,
    hook: Hook,
}

#[derive(Default)]
struct Inner {
    next_id: HookId,
    subscriptions: Vec<Subscription>,
}

pub struct StatisticsBus {
    inner: Mutex<Inner>,
}

impl StatisticsBus {
    pub fn new() -> Self {
        StatisticsBus { inner: Mutex::new(Inner::default()) }
    }

    pub fn subscribe(&self, hook: Hook) -> HookId {
        let mut inner = self.inner.lock().expect("statistics bus mutex poisoned");
        inner.next_id += 1;
        let id = inner.next_id;
        inner.subscriptions.push(Subscription { id, hook });
        id
    }

    pub fn unsubscribe(&self, id: HookId) {
        let mut inner = self.inner.lock().expect("statistics bus mutex poisoned");
        inner.subscriptions.retain(|s| s.id != id);
    }

    pub fn has_subscribers(&self) -> bool {
        !self.inner.lock().expect("statistics bus mutex poisoned").subscriptions.is_empty()
    }

    /// Delivers `event` to every current subscriber in registration order. A subscriber
    /// returning `false` is removed only after this fan-out completes, so it is safe for a
    /// callback to unsubscribe itself (or another hook) mid-delivery.
    pub fn emit(&self, event: &PtpStatisticsEvent) {
        let mut inner = self.inner.lock().expect("statistics bus mutex poisoned");
        let mut to_remove = Vec::new();
        for sub in inner.subscriptions.iter_mut() {
            if !(sub.hook)(event) {
                to_remove.push(sub.id);
            }
        }
        if !to_remove.is_empty() {
            inner.subscriptions.retain(|s| !to_remove.contains(&s.id));
        }
    }
}

impl Default for StatisticsBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn delivers_to_all_subscribers_in_order() {
        let bus = StatisticsBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order1 = order.clone();
        bus.subscribe(Box::new(move |_| {
            order1.lock().unwrap().push(1);
            true
        }));
        let order2 = order.clone();
        bus.subscribe(Box::new(move |_| {
            order2.lock().unwrap().push(2);
            true
        }));

        bus.emit(&PtpStatisticsEvent::NewDomainFound { domain: 0 });
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn subscriber_can_detach_itself_mid_iteration() {
        let bus = StatisticsBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls1 = calls.clone();
        bus.subscribe(Box::new(move |_| {
            calls1.fetch_add(1, Ordering::SeqCst);
            false // detach after first call
        }));

        bus.emit(&PtpStatisticsEvent::NewDomainFound { domain: 0 });
        bus.emit(&PtpStatisticsEvent::NewDomainFound { domain: 0 });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!bus.has_subscribers());
    }

    #[test]
    fn a_hook_can_unsubscribe_a_different_hook_mid_iteration() {
        let bus = StatisticsBus::new();
        let other_calls = Arc::new(AtomicUsize::new(0));

        // Registered first, will be told to detach.
        let id_holder: Arc<Mutex<Option<HookId>>> = Arc::new(Mutex::new(None));
        let id_holder_for_first = id_holder.clone();
        let first_calls = Arc::new(AtomicUsize::new(0));
        let first_calls_clone = first_calls.clone();
        let first_id = bus.subscribe(Box::new(move |_| {
            first_calls_clone.fetch_add(1, Ordering::SeqCst);
            true
        }));
        *id_holder_for_first.lock().unwrap() = Some(first_id);

        let other_calls_clone = other_calls.clone();
        bus.subscribe(Box::new(move |_| {
            other_calls_clone.fetch_add(1, Ordering::SeqCst);
            true
        }));

        bus.unsubscribe(first_id);
        bus.emit(&PtpStatisticsEvent::NewDomainFound { domain: 0 });

        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
        assert_eq!(other_calls.load(Ordering::SeqCst), 1);
    }
}
