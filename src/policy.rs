use crate::config::Config;

/// Decides whether bulk data reachable from a decoded reference is copied out
/// or viewed in place.
///
/// The policy is fixed at startup. Guards take a snapshot of it when they are
/// entered, so a query is consistent for the whole guard scope.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ForceCopyPolicy {
    enabled: bool,
}

impl ForceCopyPolicy {
    pub const fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.force_copy)
    }

    #[inline]
    pub const fn is_force_copy_enabled(&self) -> bool {
        self.enabled
    }
}
