//! Derives the address recorded for a pod.

use crate::subscriber::PodInfo;

pub trait Resolver: Send + Sync + 'static {
    /// Returns the address to record for `pod`, or `None` if it cannot be resolved yet.
    ///
    /// `None` never clears an address resolved earlier.
    fn resolve(&self, pod: &PodInfo) -> Option<String>;
}

/// Leaves every entry unresolved.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unresolved;

impl Resolver for Unresolved {
    fn resolve(&self, _pod: &PodInfo) -> Option<String> {
        None
    }
}

/// Uses the IP the pod reports in its status.
#[derive(Debug, Clone, Copy, Default)]
pub struct PodIp;

impl Resolver for PodIp {
    fn resolve(&self, pod: &PodInfo) -> Option<String> {
        pod.pod_ip.clone().filter(|ip| !ip.is_empty())
    }
}
