use std::sync::{Arc, Weak};

use crate::engine::{GraphBuildingContext, ProducerCore, ResolvedValueProducer};
use crate::value::{ResolvedValue, ValueRequirement};

/// Already knows its only answer.
pub(crate) struct SingleResolvedValueProducer {
    core: ProducerCore,
}

impl SingleResolvedValueProducer {
    pub(crate) fn new(
        ctx: &mut GraphBuildingContext,
        requirement: ValueRequirement,
        value: Arc<ResolvedValue>,
    ) -> Arc<Self> {
        let producer = Arc::new_cyclic(|this: &Weak<SingleResolvedValueProducer>| Self {
            core: ProducerCore::new(requirement, this.clone()),
        });
        producer.core.push_result(ctx, value, true);
        producer
    }
}

impl ResolvedValueProducer for SingleResolvedValueProducer {
    fn core(&self) -> &ProducerCore {
        &self.core
    }

    fn pump_impl(&self, _: &mut GraphBuildingContext) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context;
    use crate::engine::producer::tests::{Event, Recorder, value};
    use crate::value::TargetSpecification;

    #[test]
    fn test_every_subscriber_gets_the_value() {
        let mut ctx = context::tests::test_context();
        let requirement = ValueRequirement::of("A", TargetSpecification::primitive("T"));
        let producer = SingleResolvedValueProducer::new(&mut ctx, requirement, value("A"));
        assert!(producer.core().is_finished());

        for _ in 0..2 {
            let recorder = Arc::new(Recorder::default());
            assert!(producer.core().add_callback(&mut ctx, recorder.clone()).is_none());
            assert_eq!(recorder.events(), [Event::Resolved("A".into(), false)]);
        }
        assert_eq!(producer.release(&mut ctx), 0);
    }
}
