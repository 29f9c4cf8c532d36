//! Everything a tick needs, bundled and passed in at construction.

use std::sync::Arc;

use fleet_core::AutoscalingOptions;
use fleetscale_cloud::{CloudProvider, ClusterApi};
use fleetscale_simulator::{BinpackingEstimator, Estimator, PredicateChecker, ResourceFitChecker};

use crate::expander::{Expander, expander_for};
use crate::similarity::{NodeGroupSimilarity, TemplateSimilarity};

pub struct AutoscalingContext {
    pub options: AutoscalingOptions,
    pub cloud: Arc<dyn CloudProvider>,
    pub api: Arc<dyn ClusterApi>,
    pub predicates: Arc<dyn PredicateChecker>,
    pub estimator: Arc<dyn Estimator>,
    pub expander: Arc<dyn Expander>,
    pub similarity: Arc<dyn NodeGroupSimilarity>,
}

impl AutoscalingContext {
    /// Default strategies: resource-fit predicates, bin-packing capped at
    /// the bulk scale-up count, the configured expander and template
    /// similarity.
    pub fn new(
        options: AutoscalingOptions,
        cloud: Arc<dyn CloudProvider>,
        api: Arc<dyn ClusterApi>,
    ) -> Self {
        let predicates: Arc<dyn PredicateChecker> = Arc::new(ResourceFitChecker::new());
        let estimator = Arc::new(BinpackingEstimator::new(
            predicates.clone(),
            options.scale_up.max_bulk_scale_up_count as usize,
        ));
        let expander = expander_for(options.expander, &options.node_group_priorities);
        Self {
            options,
            cloud,
            api,
            predicates,
            estimator,
            expander,
            similarity: Arc::new(TemplateSimilarity::new()),
        }
    }

    /// Replace the configured expander.
    pub fn with_expander(mut self, expander: Arc<dyn Expander>) -> Self {
        self.expander = expander;
        self
    }

    /// Replace the bin-packing estimator.
    pub fn with_estimator(mut self, estimator: Arc<dyn Estimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Replace the predicate checker used by every simulation.
    pub fn with_predicates(mut self, predicates: Arc<dyn PredicateChecker>) -> Self {
        self.predicates = predicates;
        self
    }

    /// Replace the node group similarity used for balancing.
    pub fn with_similarity(mut self, similarity: Arc<dyn NodeGroupSimilarity>) -> Self {
        self.similarity = similarity;
        self
    }
}
