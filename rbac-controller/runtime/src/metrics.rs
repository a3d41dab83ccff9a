use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Counts reconciliation outcomes.
///
/// Both families are labeled by the phase of a target's reconciliation:
/// `resolve` for directory expansion and `update` for the cluster write.
#[derive(Clone, Debug)]
pub struct SyncMetrics {
    updates: Family<PhaseLabels, Counter>,
    errors: Family<PhaseLabels, Counter>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Resolve,
    Update,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct PhaseLabels {
    phase: &'static str,
}

// === impl SyncMetrics ===

impl SyncMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let updates = Family::<PhaseLabels, Counter>::default();
        reg.register(
            "role_updates",
            "Cumulative number of role update operations",
            updates.clone(),
        );

        let errors = Family::<PhaseLabels, Counter>::default();
        reg.register(
            "role_update_errors",
            "Cumulative number of errors during role update operations",
            errors.clone(),
        );

        Self { updates, errors }
    }

    pub fn updated(&self) {
        self.updates.get_or_create(&Phase::Update.into()).inc();
    }

    pub fn failed(&self, phase: Phase) {
        self.errors.get_or_create(&phase.into()).inc();
    }

    #[cfg(test)]
    pub(crate) fn update_count(&self) -> u64 {
        self.updates.get_or_create(&Phase::Update.into()).get()
    }

    #[cfg(test)]
    pub(crate) fn error_count(&self, phase: Phase) -> u64 {
        self.errors.get_or_create(&phase.into()).get()
    }
}

// === impl Phase ===

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolve => "resolve",
            Self::Update => "update",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_str().fmt(f)
    }
}

impl From<Phase> for PhaseLabels {
    fn from(phase: Phase) -> Self {
        Self {
            phase: phase.as_str(),
        }
    }
}
