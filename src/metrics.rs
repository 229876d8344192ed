use crate::types::MetricRecord;
use std::time::Duration;
use tokio::sync::mpsc;

const QUEUE_DEPTH: usize = 1_024;
const POST_TIMEOUT: Duration = Duration::from_secs(5);

/// Fire-and-forget recorder: one bounded queue, one worker posting to the
/// metrics sink. Backpressure drops records; the response path never waits
/// on this.
#[derive(Clone)]
pub struct MetricsSink {
    tx: Option<mpsc::Sender<MetricRecord>>,
}

impl MetricsSink {
    /// A sink without a URL swallows records after logging them at debug.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn spawn(client: reqwest::Client, sink_url: String, api_key: Option<String>) -> Self {
        let (tx, mut rx) = mpsc::channel::<MetricRecord>(QUEUE_DEPTH);
        let endpoint = format!("{}/api/metrics/record", sink_url.trim_end_matches('/'));
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let mut request = client.post(&endpoint).timeout(POST_TIMEOUT).json(&record);
                if let Some(key) = api_key.as_deref() {
                    request = request.bearer_auth(key);
                }
                match request.send().await {
                    Ok(resp) if resp.status().is_success() => {}
                    Ok(resp) => {
                        tracing::debug!(status = %resp.status(), "metrics sink rejected record");
                    }
                    Err(err) => {
                        tracing::debug!(%err, "metrics sink unreachable");
                    }
                }
            }
        });
        Self { tx: Some(tx) }
    }

    pub fn record(&self, record: MetricRecord) {
        tracing::debug!(
            request_id = %record.request_id,
            decision = ?record.decision,
            status = record.status_code,
            latency_ms = record.latency_ms,
            "request metric"
        );
        if let Some(tx) = &self.tx {
            if let Err(err) = tx.try_send(record) {
                tracing::debug!(%err, "metric queue full; dropping record");
            }
        }
    }
}
