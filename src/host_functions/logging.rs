//! Error reporting host function.
//!
//! Reports are always logged; when the host provides an error sink they are
//! forwarded to it as well.

use super::{arg, host_fn, HostFn, HostState};
use crate::envelope::{parse_request, respond};
use crate::error::BridgeError;
use crate::host::ErrorReport;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// `report_error`: `{message, name?, stack?, context?}`
pub fn report_error(state: Arc<HostState>) -> HostFn {
    host_fn(move |args| {
        let state = Arc::clone(&state);
        async move {
            let masker = state.masker.clone();
            respond(&masker, async move {
                let report: ErrorReport = parse_request(&arg(&args, 0, "payload")?)?;
                log_report(&report);

                if let Some(sink) = state.env.error_sink() {
                    sink.report(report).await.map_err(|e| BridgeError::host(&e))?;
                }
                state.metrics.record_report(true);
                Ok(Value::Null)
            })
            .await
        }
    })
}

fn log_report(report: &ErrorReport) {
    let context = report
        .context
        .as_ref()
        .map(Value::to_string)
        .unwrap_or_default();
    warn!(
        name = %report.name,
        context = %context,
        stack = report.stack.as_deref().unwrap_or(""),
        "Guest error reported: {}",
        report.message
    );
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{call, state_for};
    use super::*;
    use crate::host::{ErrorSink, HostEnv};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect {
        reports: Mutex<Vec<ErrorReport>>,
    }

    #[async_trait]
    impl ErrorSink for Collect {
        async fn report(&self, report: ErrorReport) -> anyhow::Result<()> {
            self.reports.lock().push(report);
            Ok(())
        }
    }

    struct Down;

    #[async_trait]
    impl ErrorSink for Down {
        async fn report(&self, _report: ErrorReport) -> anyhow::Result<()> {
            anyhow::bail!("collector offline")
        }
    }

    #[tokio::test]
    async fn test_report_without_sink_is_logged() {
        let f = report_error(state_for(HostEnv::new()));
        let envelope = call(&f, &[r#"{"message":"boom"}"#]).await;
        assert!(envelope.ok);
    }

    #[tokio::test]
    async fn test_report_forwarded_to_sink() {
        let sink = Arc::new(Collect::default());
        let state = state_for(HostEnv::new().with_error_sink(sink.clone()));
        let f = report_error(Arc::clone(&state));

        call(
            &f,
            &[r#"{"message":"boom","name":"NoMethodError","context":{"dispatch":"fetch"}}"#],
        )
        .await;

        let reports = sink.reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].name, "NoMethodError");
        assert_eq!(state.metrics.reports_delivered(), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_is_envelope_error() {
        let f = report_error(state_for(HostEnv::new().with_error_sink(Arc::new(Down))));
        let envelope = call(&f, &[r#"{"message":"boom"}"#]).await;
        assert!(!envelope.ok);
        assert_eq!(envelope.error.unwrap().message, "collector offline");
    }
}
