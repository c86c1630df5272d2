use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace, warn};

use crate::core::next_object_id;
use crate::engine::{CallbackRef, GraphBuildingContext, ResolutionPump, ResolvedValueProducer};
use crate::failure::{ResolutionFailure, merge_into};
use crate::value::{ResolvedValue, ValueRequirement, ValueSpecification};

/// What the producer was last asked or told about its results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpState {
    Idle,
    PumpRequested,
    ResultReady,
    LastResultReady,
}

struct Subscriber {
    callback: CallbackRef,
    /// Results already handed to this subscriber.
    delivered: usize,
    /// Pumped with nothing left to deliver.
    waiting: bool,
}

struct CoreState {
    results: Vec<Arc<ResolvedValue>>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscription: u64,
    finished: bool,
    failure: Option<ResolutionFailure>,
    recursion: bool,
    ref_count: usize,
    pumping: PumpState,
}

impl CoreState {
    fn subscribe(&mut self, callback: CallbackRef, delivered: usize, waiting: bool) -> u64 {
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.subscribers.insert(
            id,
            Subscriber {
                callback,
                delivered,
                waiting,
            },
        );
        self.ref_count += 1;
        id
    }

    /// Returns true when the caller should run `pump_impl`.
    fn request_pump(&mut self) -> bool {
        match self.pumping {
            PumpState::Idle | PumpState::ResultReady => {
                self.pumping = PumpState::PumpRequested;
                true
            }
            PumpState::PumpRequested | PumpState::LastResultReady => false,
        }
    }
}

enum Delivery {
    Resolved {
        callback: CallbackRef,
        value: Arc<ResolvedValue>,
        pump: Option<ResolutionPump>,
    },
    Failed {
        callback: CallbackRef,
        failure: Option<ResolutionFailure>,
        recursion: bool,
    },
}

/// Shared bookkeeping of every producer: the results pushed so far, the
/// subscribers and how far each of them got, the failure to report once the
/// results run out, and the logical reference count.
///
/// Callbacks are never invoked while the state lock is held.
pub(crate) struct ProducerCore {
    id: u64,
    requirement: ValueRequirement,
    this: Weak<dyn ResolvedValueProducer>,
    state: Mutex<CoreState>,
}

impl ProducerCore {
    pub(crate) fn new(requirement: ValueRequirement, this: Weak<dyn ResolvedValueProducer>) -> Self {
        Self {
            id: next_object_id(),
            requirement,
            this,
            state: Mutex::new(CoreState {
                results: Vec::new(),
                subscribers: HashMap::new(),
                next_subscription: 1,
                finished: false,
                failure: None,
                recursion: false,
                ref_count: 1,
                pumping: PumpState::Idle,
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn requirement(&self) -> &ValueRequirement {
        &self.requirement
    }

    pub(crate) fn ref_count(&self) -> usize {
        self.state.lock().unwrap().ref_count
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.lock().unwrap().finished
    }

    pub(crate) fn is_discarded(&self) -> bool {
        self.state.lock().unwrap().ref_count == 0
    }

    pub(crate) fn result_count(&self) -> usize {
        self.state.lock().unwrap().results.len()
    }

    pub(crate) fn result_specifications(&self) -> Vec<ValueSpecification> {
        let state = self.state.lock().unwrap();
        state.results.iter().map(|value| value.specification().clone()).collect()
    }

    pub(crate) fn was_recursion_detected(&self) -> bool {
        self.state.lock().unwrap().recursion
    }

    pub(crate) fn set_recursion_detected(&self) {
        self.state.lock().unwrap().recursion = true;
    }

    /// Takes a logical reference. Fails once the producer has been discarded.
    pub(crate) fn add_ref(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.ref_count == 0 {
            return false;
        }
        state.ref_count += 1;
        true
    }

    /// Drops a logical reference without running any discard hook. At zero the
    /// stored results, subscribers and failure are dropped for good.
    ///
    /// Returns the remaining count, or `None` if the producer had already been
    /// discarded and nothing was released.
    pub(crate) fn release_ref(&self) -> Option<usize> {
        let mut state = self.state.lock().unwrap();
        if state.ref_count == 0 {
            warn!(producer = self.id, requirement = %self.requirement, "release of discarded producer");
            return None;
        }
        state.ref_count -= 1;
        if state.ref_count == 0 {
            trace!(producer = self.id, requirement = %self.requirement, "discarding producer state");
            state.results.clear();
            state.subscribers.clear();
            state.failure = None;
        }
        Some(state.ref_count)
    }

    pub(crate) fn store_failure(&self, failure: Option<&ResolutionFailure>) {
        merge_into(&mut self.state.lock().unwrap().failure, failure);
    }

    /// Subscribes `callback`. The first result, or the failure, may be delivered
    /// before this returns. Returns the handle of a subscription that is still
    /// open.
    pub(crate) fn add_callback(
        &self,
        ctx: &mut GraphBuildingContext,
        callback: CallbackRef,
    ) -> Option<ResolutionPump> {
        let this = self.this.upgrade()?;
        let mut state = self.state.lock().unwrap();

        if state.ref_count == 0 {
            drop(state);
            warn!(producer = self.id, requirement = %self.requirement, "callback added to discarded producer");
            ctx.failed(&callback, &self.requirement, None);
            return None;
        }

        if let Some(first) = state.results.first().cloned() {
            if state.finished && state.results.len() == 1 {
                drop(state);
                ctx.resolved(&callback, &self.requirement, first, None);
                return None;
            }
            let id = state.subscribe(callback.clone(), 1, false);
            drop(state);
            let pump = ResolutionPump::new(this, id);
            ctx.resolved(&callback, &self.requirement, first, Some(pump.clone()));
            return Some(pump);
        }

        if state.finished {
            let failure = state.failure.clone();
            let recursion = state.recursion;
            drop(state);
            self.deliver(
                ctx,
                Delivery::Failed {
                    callback,
                    failure,
                    recursion,
                },
            );
            return None;
        }

        let id = state.subscribe(callback, 0, true);
        let pump_now = state.request_pump();
        drop(state);
        if pump_now {
            this.pump_impl(ctx);
        }
        Some(ResolutionPump::new(this, id))
    }

    /// Next result for one subscriber, from the stored results when possible.
    pub(crate) fn pump(&self, ctx: &mut GraphBuildingContext, subscription: u64) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let mut state = self.state.lock().unwrap();
        if state.ref_count == 0 {
            debug!(producer = self.id, "pump of discarded producer");
            return;
        }
        let available = state.results.len();
        let finished = state.finished;
        let Some(subscriber) = state.subscribers.get_mut(&subscription) else {
            debug!(producer = self.id, subscription, "rogue pump");
            return;
        };
        if subscriber.waiting {
            debug!(producer = self.id, subscription, "pump while already waiting");
            return;
        }

        if subscriber.delivered < available {
            let index = subscriber.delivered;
            subscriber.delivered += 1;
            let last = finished && subscriber.delivered == available;
            let callback = subscriber.callback.clone();
            let value = state.results[index].clone();
            if last {
                state.subscribers.remove(&subscription);
            }
            drop(state);
            let pump = (!last).then(|| ResolutionPump::new(this, subscription));
            self.deliver(
                ctx,
                Delivery::Resolved {
                    callback,
                    value,
                    pump,
                },
            );
            if last {
                self.release_subscription(ctx);
            }
        } else if finished {
            let callback = subscriber.callback.clone();
            state.subscribers.remove(&subscription);
            let failure = state.failure.clone();
            let recursion = state.recursion;
            drop(state);
            self.deliver(
                ctx,
                Delivery::Failed {
                    callback,
                    failure,
                    recursion,
                },
            );
            self.release_subscription(ctx);
        } else {
            subscriber.waiting = true;
            let pump_now = state.request_pump();
            drop(state);
            if pump_now {
                this.pump_impl(ctx);
            }
        }
    }

    /// Ends one subscription without further deliveries.
    pub(crate) fn close(&self, ctx: &mut GraphBuildingContext, subscription: u64) {
        let removed = self
            .state
            .lock()
            .unwrap()
            .subscribers
            .remove(&subscription)
            .is_some();
        if removed {
            self.release_subscription(ctx);
        } else {
            trace!(producer = self.id, subscription, "close of ended subscription");
        }
    }

    /// Stores and delivers a new result to every waiting subscriber. Returns
    /// false if the result was not accepted: a duplicate, or the producer has
    /// already finished or been discarded.
    pub(crate) fn push_result(
        &self,
        ctx: &mut GraphBuildingContext,
        value: Arc<ResolvedValue>,
        last: bool,
    ) -> bool {
        let Some(this) = self.this.upgrade() else {
            return false;
        };
        let mut state = self.state.lock().unwrap();
        if state.ref_count == 0 {
            debug!(producer = self.id, value = %value, "result for discarded producer");
            return false;
        }
        if state.finished {
            warn!(producer = self.id, value = %value, "result for finished producer");
            return false;
        }
        if state.results.iter().any(|existing| **existing == *value) {
            debug!(producer = self.id, value = %value, "duplicate result");
            return false;
        }

        state.results.push(value.clone());
        let available = state.results.len();
        if last {
            state.finished = true;
            state.pumping = PumpState::LastResultReady;
        } else {
            state.pumping = PumpState::ResultReady;
        }

        let mut deliveries = Vec::new();
        let mut ended = 0;
        let waiting: Vec<u64> = state
            .subscribers
            .iter()
            .filter(|(_, subscriber)| subscriber.waiting)
            .map(|(id, _)| *id)
            .collect();
        for id in waiting {
            if last {
                if let Some(subscriber) = state.subscribers.remove(&id) {
                    ended += 1;
                    deliveries.push(Delivery::Resolved {
                        callback: subscriber.callback,
                        value: value.clone(),
                        pump: None,
                    });
                }
            } else if let Some(subscriber) = state.subscribers.get_mut(&id) {
                subscriber.waiting = false;
                subscriber.delivered = available;
                deliveries.push(Delivery::Resolved {
                    callback: subscriber.callback.clone(),
                    value: value.clone(),
                    pump: Some(ResolutionPump::new(this.clone(), id)),
                });
            }
        }
        drop(state);

        trace!(producer = self.id, value = %value, last, subscribers = deliveries.len(), "pushed result");
        for delivery in deliveries {
            self.deliver(ctx, delivery);
        }
        for _ in 0..ended {
            self.release_subscription(ctx);
        }
        true
    }

    /// No more results will come. Waiting subscribers receive the failure;
    /// the others find out on their next pump.
    pub(crate) fn finished(&self, ctx: &mut GraphBuildingContext) {
        let mut state = self.state.lock().unwrap();
        if state.ref_count == 0 || state.finished {
            return;
        }
        state.finished = true;
        state.pumping = PumpState::Idle;
        let waiting: Vec<u64> = state
            .subscribers
            .iter()
            .filter(|(_, subscriber)| subscriber.waiting)
            .map(|(id, _)| *id)
            .collect();
        let callbacks: Vec<CallbackRef> = waiting
            .iter()
            .filter_map(|id| state.subscribers.remove(id))
            .map(|subscriber| subscriber.callback)
            .collect();
        let failure = state.failure.clone();
        let recursion = state.recursion;
        drop(state);

        debug!(
            producer = self.id,
            requirement = %self.requirement,
            failed = callbacks.len(),
            "producer finished"
        );
        let ended = callbacks.len();
        for callback in callbacks {
            self.deliver(
                ctx,
                Delivery::Failed {
                    callback,
                    failure: failure.clone(),
                    recursion,
                },
            );
        }
        for _ in 0..ended {
            self.release_subscription(ctx);
        }
    }

    /// Subscriptions currently waiting for a result, with their callbacks.
    pub(crate) fn waiting_subscriptions(&self) -> Vec<(u64, CallbackRef)> {
        self.state
            .lock()
            .unwrap()
            .subscribers
            .iter()
            .filter(|(_, subscriber)| subscriber.waiting)
            .map(|(id, subscriber)| (*id, subscriber.callback.clone()))
            .collect()
    }

    /// Fails one waiting subscription as recursive. Returns false if it is no
    /// longer waiting.
    pub(crate) fn cancel_waiting(
        &self,
        ctx: &mut GraphBuildingContext,
        subscription: u64,
        failure: Option<ResolutionFailure>,
    ) -> bool {
        let mut state = self.state.lock().unwrap();
        let waiting = state
            .subscribers
            .get(&subscription)
            .is_some_and(|subscriber| subscriber.waiting);
        if !waiting {
            return false;
        }
        let Some(subscriber) = state.subscribers.remove(&subscription) else {
            return false;
        };
        // The outstanding request still serves anyone else waiting.
        let others_waiting = state.subscribers.values().any(|subscriber| subscriber.waiting);
        if state.pumping == PumpState::PumpRequested && !others_waiting {
            state.pumping = PumpState::Idle;
        }
        drop(state);

        self.deliver(
            ctx,
            Delivery::Failed {
                callback: subscriber.callback,
                failure,
                recursion: true,
            },
        );
        self.release_subscription(ctx);
        true
    }

    fn deliver(&self, ctx: &mut GraphBuildingContext, delivery: Delivery) {
        match delivery {
            Delivery::Resolved {
                callback,
                value,
                pump,
            } => ctx.resolved(&callback, &self.requirement, value, pump),
            Delivery::Failed {
                callback,
                failure,
                recursion,
            } => {
                if recursion {
                    callback.recursion_detected();
                }
                ctx.failed(&callback, &self.requirement, failure);
            }
        }
    }

    fn release_subscription(&self, ctx: &mut GraphBuildingContext) {
        if let Some(this) = self.this.upgrade() {
            this.release(ctx);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use super::*;
    use crate::engine::{ResolvedValueCallback, context};
    use crate::function::{ParameterizedFunction, market_data_value};
    use crate::value::{TargetSpecification, ValueProperties, ValueSpecification};

    /// A producer whose results are pushed by hand.
    pub(crate) struct ManualProducer {
        core: ProducerCore,
        pub pumps: Mutex<usize>,
        pub discarded: Mutex<bool>,
    }

    impl ManualProducer {
        pub(crate) fn new(requirement: ValueRequirement) -> Arc<Self> {
            Arc::new_cyclic(|this: &Weak<ManualProducer>| Self {
                core: ProducerCore::new(requirement, this.clone()),
                pumps: Mutex::new(0),
                discarded: Mutex::new(false),
            })
        }
    }

    impl ResolvedValueProducer for ManualProducer {
        fn core(&self) -> &ProducerCore {
            &self.core
        }

        fn pump_impl(&self, _: &mut GraphBuildingContext) {
            *self.pumps.lock().unwrap() += 1;
        }

        fn discard(&self, _: &mut GraphBuildingContext) {
            *self.discarded.lock().unwrap() = true;
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Event {
        Resolved(String, bool),
        Failed,
        Recursion,
    }

    /// Records deliveries and keeps the latest pump.
    #[derive(Default)]
    pub(crate) struct Recorder {
        pub events: Mutex<Vec<Event>>,
        pub pump: Mutex<Option<ResolutionPump>>,
    }

    impl Recorder {
        pub(crate) fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        pub(crate) fn take_pump(&self) -> Option<ResolutionPump> {
            self.pump.lock().unwrap().take()
        }
    }

    impl ResolvedValueCallback for Recorder {
        fn resolved(
            &self,
            _: &mut GraphBuildingContext,
            _: &ValueRequirement,
            value: Arc<ResolvedValue>,
            pump: Option<ResolutionPump>,
        ) {
            let name = value.specification().name().to_string();
            self.events
                .lock()
                .unwrap()
                .push(Event::Resolved(name, pump.is_some()));
            *self.pump.lock().unwrap() = pump;
        }

        fn failed(&self, _: &mut GraphBuildingContext, _: &ValueRequirement, _: Option<ResolutionFailure>) {
            self.events.lock().unwrap().push(Event::Failed);
        }

        fn recursion_detected(&self) {
            self.events.lock().unwrap().push(Event::Recursion);
        }
    }

    pub(crate) fn value(name: &str) -> Arc<ResolvedValue> {
        let spec = ValueSpecification::new(name, TargetSpecification::primitive("T"), ValueProperties::none());
        Arc::new(market_data_value(spec))
    }

    fn requirement() -> ValueRequirement {
        ValueRequirement::of("V", TargetSpecification::primitive("T"))
    }

    #[test]
    fn test_waiting_subscriber_gets_pushed_result() {
        let mut ctx = context::tests::test_context();
        let producer = ManualProducer::new(requirement());
        let recorder = Arc::new(Recorder::default());

        let handle = producer.core().add_callback(&mut ctx, recorder.clone());
        assert!(handle.is_some());
        assert_eq!(*producer.pumps.lock().unwrap(), 1);
        assert_eq!(producer.core().ref_count(), 2);

        assert!(producer.core().push_result(&mut ctx, value("A"), false));
        assert_eq!(recorder.events(), [Event::Resolved("A".into(), true)]);

        // duplicates are refused
        assert!(!producer.core().push_result(&mut ctx, value("A"), false));

        recorder.take_pump().unwrap().pump(&mut ctx);
        assert_eq!(*producer.pumps.lock().unwrap(), 2);
        producer.core().finished(&mut ctx);
        assert_eq!(recorder.events().last(), Some(&Event::Failed));
        assert_eq!(producer.core().ref_count(), 1);
    }

    #[test]
    fn test_late_subscriber_replays_results() {
        let mut ctx = context::tests::test_context();
        let producer = ManualProducer::new(requirement());
        assert!(producer.core().push_result(&mut ctx, value("A"), false));
        assert!(producer.core().push_result(&mut ctx, value("B"), true));

        let recorder = Arc::new(Recorder::default());
        producer.core().add_callback(&mut ctx, recorder.clone());
        assert_eq!(recorder.events(), [Event::Resolved("A".into(), true)]);

        recorder.take_pump().unwrap().pump(&mut ctx);
        assert_eq!(
            recorder.events(),
            [Event::Resolved("A".into(), true), Event::Resolved("B".into(), false)]
        );
        // the subscription ended with the last result
        assert_eq!(producer.core().ref_count(), 1);
        assert_eq!(*producer.pumps.lock().unwrap(), 0);
    }

    #[test]
    fn test_single_final_result_delivered_without_pump() {
        let mut ctx = context::tests::test_context();
        let producer = ManualProducer::new(requirement());
        assert!(producer.core().push_result(&mut ctx, value("A"), true));
        assert!(!producer.core().push_result(&mut ctx, value("B"), false));

        let recorder = Arc::new(Recorder::default());
        assert!(producer.core().add_callback(&mut ctx, recorder.clone()).is_none());
        assert_eq!(recorder.events(), [Event::Resolved("A".into(), false)]);
    }

    #[test]
    fn test_finished_without_results_reports_recursion() {
        let mut ctx = context::tests::test_context();
        let producer = ManualProducer::new(requirement());
        producer.core().set_recursion_detected();
        producer.core().finished(&mut ctx);

        let recorder = Arc::new(Recorder::default());
        assert!(producer.core().add_callback(&mut ctx, recorder.clone()).is_none());
        assert_eq!(recorder.events(), [Event::Recursion, Event::Failed]);
    }

    #[test]
    fn test_release_discards_once() {
        let mut ctx = context::tests::test_context();
        let producer = ManualProducer::new(requirement());
        assert!(producer.core().add_ref());
        assert_eq!(producer.release(&mut ctx), 1);
        assert!(!*producer.discarded.lock().unwrap());
        assert_eq!(producer.release(&mut ctx), 0);
        assert!(*producer.discarded.lock().unwrap());

        // never below zero and no second discard hook
        *producer.discarded.lock().unwrap() = false;
        assert_eq!(producer.release(&mut ctx), 0);
        assert!(!*producer.discarded.lock().unwrap());
        assert!(!producer.core().add_ref());
        assert!(!producer.core().push_result(&mut ctx, value("A"), false));
    }

    #[test]
    fn test_release_ref_reports_discarded() {
        let producer = ManualProducer::new(requirement());
        assert!(producer.core().add_ref());
        assert_eq!(producer.core().release_ref(), Some(1));
        assert_eq!(producer.core().release_ref(), Some(0));
        assert_eq!(producer.core().release_ref(), None);
        assert_eq!(producer.core().ref_count(), 0);
        assert!(producer.core().is_discarded());
    }

    #[test]
    fn test_close_releases_subscription() {
        let mut ctx = context::tests::test_context();
        let producer = ManualProducer::new(requirement());
        let recorder = Arc::new(Recorder::default());
        let handle = producer.core().add_callback(&mut ctx, recorder.clone()).unwrap();
        assert_eq!(producer.core().ref_count(), 2);

        handle.close(&mut ctx);
        assert_eq!(producer.core().ref_count(), 1);
        // a second close is ignored
        handle.close(&mut ctx);
        assert_eq!(producer.core().ref_count(), 1);

        assert!(producer.core().push_result(&mut ctx, value("A"), false));
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn test_cancel_waiting_fails_as_recursive() {
        let mut ctx = context::tests::test_context();
        let producer = ManualProducer::new(requirement());
        let recorder = Arc::new(Recorder::default());
        let handle = producer.core().add_callback(&mut ctx, recorder.clone()).unwrap();

        let waiting = producer.core().waiting_subscriptions();
        assert_eq!(waiting.len(), 1);
        assert!(producer.core().cancel_waiting(&mut ctx, handle.subscription(), None));
        assert_eq!(recorder.events(), [Event::Recursion, Event::Failed]);
        assert!(!producer.core().cancel_waiting(&mut ctx, handle.subscription(), None));
        assert_eq!(producer.core().ref_count(), 1);
    }

    #[test]
    fn test_cancel_waiting_keeps_request_for_others() {
        let mut ctx = context::tests::test_context();
        let producer = ManualProducer::new(requirement());
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let first_handle = producer.core().add_callback(&mut ctx, first.clone()).unwrap();
        let second_handle = producer.core().add_callback(&mut ctx, second.clone()).unwrap();
        assert_eq!(*producer.pumps.lock().unwrap(), 1);

        assert!(producer.core().cancel_waiting(&mut ctx, first_handle.subscription(), None));
        // The second subscriber still waits on the first request.
        let third = Arc::new(Recorder::default());
        producer.core().add_callback(&mut ctx, third.clone()).unwrap();
        assert_eq!(*producer.pumps.lock().unwrap(), 1);

        assert!(producer.core().cancel_waiting(&mut ctx, second_handle.subscription(), None));
        assert!(producer.core().push_result(&mut ctx, value("A"), false));
        assert_eq!(third.events(), [Event::Resolved("A".into(), true)]);
        assert!(second.events().ends_with(&[Event::Recursion, Event::Failed]));
    }

    #[test]
    fn test_cancel_last_waiting_allows_new_request() {
        let mut ctx = context::tests::test_context();
        let producer = ManualProducer::new(requirement());
        let first = Arc::new(Recorder::default());
        let handle = producer.core().add_callback(&mut ctx, first.clone()).unwrap();
        assert!(producer.core().cancel_waiting(&mut ctx, handle.subscription(), None));

        let second = Arc::new(Recorder::default());
        producer.core().add_callback(&mut ctx, second.clone()).unwrap();
        assert_eq!(*producer.pumps.lock().unwrap(), 2);
    }

    #[test]
    fn test_market_data_value_shape() {
        let value = value("A");
        assert!(value.inputs().is_empty());
        assert_eq!(value.outputs(), &BTreeSet::from([value.specification().clone()]));
        assert_eq!(
            value.function(),
            &ParameterizedFunction::of(Arc::new(crate::function::MarketDataSourcingFunction))
        );
    }
}
