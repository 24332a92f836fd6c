use std::sync::Once;

use futures::stream;

use crate::rate_limiting::{CallError, CpuStats, LoadReport, ServerStats};

/// A bulk-write response: per-entry status codes plus optional server stats.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct MutateResponse {
    pub(crate) entry_codes: Vec<i32>,
    pub(crate) server_stats: Option<ServerStats>,
}

pub(crate) type ResponseStream = stream::Iter<std::vec::IntoIter<Result<MutateResponse, CallError>>>;

impl MutateResponse {
    pub(crate) fn with_cpus(cpus: &[f64]) -> Self {
        let cpu_stats = cpus
            .iter()
            .enumerate()
            .map(|(i, cpu)| cpu_stats(&format!("us-east1-{i}"), *cpu))
            .collect();
        Self {
            entry_codes: vec![0],
            server_stats: Some(ServerStats { cpu_stats }),
        }
    }

    pub(crate) fn without_stats() -> Self {
        Self {
            entry_codes: vec![0],
            server_stats: None,
        }
    }

    pub(crate) fn entries(mut self, count: usize) -> Self {
        self.entry_codes = vec![0; count];
        self
    }
}

impl LoadReport for MutateResponse {
    fn server_stats(&self) -> Option<&ServerStats> {
        self.server_stats.as_ref()
    }
}

pub(crate) fn cpu_stats(location: &str, cpu_percent: f64) -> CpuStats {
    CpuStats {
        location: location.to_string(),
        cpu_percent,
    }
}

pub(crate) fn trace_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
