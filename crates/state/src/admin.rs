//! Admin-facing service status
//!
//! The seam the out-of-scope GUI / REST layers read. Subsystems report
//! their running state and last fatal error here; nothing in the core
//! depends on it beyond writing.

use std::sync::RwLock;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStatus {
    pub running: bool,
    /// Last fatal error, empty while healthy.
    pub error: String,
}

#[derive(Debug, Default)]
struct AdminInner {
    voice: ServiceStatus,
    control: ServiceStatus,
    metrics: ServiceStatus,
}

/// Aggregated per-service status.
pub struct AdminState {
    inner: RwLock<AdminInner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Voice,
    Control,
    Metrics,
}

impl AdminState {
    pub fn new() -> Self {
        Self { inner: RwLock::new(AdminInner::default()) }
    }

    pub fn set_running(&self, service: Service, running: bool) {
        let mut inner = self.inner.write().unwrap();
        let status = Self::slot(&mut inner, service);
        status.running = running;
        if running {
            status.error.clear();
        }
    }

    pub fn set_error(&self, service: Service, error: impl Into<String>) {
        let mut inner = self.inner.write().unwrap();
        let status = Self::slot(&mut inner, service);
        status.running = false;
        status.error = error.into();
    }

    pub fn status(&self, service: Service) -> ServiceStatus {
        let inner = self.inner.read().unwrap();
        match service {
            Service::Voice => inner.voice.clone(),
            Service::Control => inner.control.clone(),
            Service::Metrics => inner.metrics.clone(),
        }
    }

    pub fn all_running(&self) -> bool {
        let inner = self.inner.read().unwrap();
        inner.voice.running && inner.control.running
    }

    fn slot(inner: &mut AdminInner, service: Service) -> &mut ServiceStatus {
        match service {
            Service::Voice => &mut inner.voice,
            Service::Control => &mut inner.control,
            Service::Metrics => &mut inner.metrics,
        }
    }
}

impl Default for AdminState {
    fn default() -> Self {
        Self::new()
    }
}
