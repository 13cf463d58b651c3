use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::broadcast;

use gauntlet_types::{EvalEvent, PassKReport, Winner};

/// In-process progress bus. Send failures (no subscribers) are ignored.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EvalEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EvalEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EvalEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub backend_url: String,
    pub battle_id: String,
}

/// Best-effort HTTP results sink. Delivery problems are logged and ignored;
/// the report on stdout is the source of truth.
pub struct BattleReporter {
    config: ReportConfig,
    client: reqwest::Client,
}

impl BattleReporter {
    pub fn new(config: ReportConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { config, client })
    }

    fn battle_url(&self) -> String {
        format!(
            "{}/battles/{}",
            self.config.backend_url.trim_end_matches('/'),
            self.config.battle_id
        )
    }

    pub async fn progress(&self, event: &EvalEvent) {
        let body = json!({
            "is_result": false,
            "message": format!("{}: {}", event.event, event.payload),
            "timestamp": Utc::now().to_rfc3339(),
            "reported_by": "gauntlet",
        });
        self.post(body).await;
    }

    pub async fn report_result(&self, report: &PassKReport) {
        let winner = match report.winner {
            Winner::Target => "target",
            Winner::Evaluator => "evaluator",
        };
        let body = json!({
            "is_result": true,
            "message": format!(
                "evaluation of {}/{} finished: success_rate={:.2}",
                report.domain, report.task_id, report.success_rate
            ),
            "winner": winner,
            "timestamp": Utc::now().to_rfc3339(),
            "reported_by": "gauntlet",
            "detail": report,
        });
        self.post(body).await;
    }

    async fn post(&self, body: serde_json::Value) {
        match self.client.post(self.battle_url()).json(&body).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::NO_CONTENT => {}
            Ok(response) => {
                tracing::debug!("battle update returned status {}", response.status());
            }
            Err(e) => {
                tracing::debug!("battle update failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bus_delivers_to_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EvalEvent::new("attempt.started", json!({"attempt": 1})));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, "attempt.started");
        assert_eq!(event.payload["attempt"], 1);
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(EvalEvent::new("run.finished", json!({})));
    }

    #[test]
    fn battle_url_joins_backend_and_id() {
        let reporter = BattleReporter::new(ReportConfig {
            backend_url: "http://backend:8000/".to_string(),
            battle_id: "b-42".to_string(),
        })
        .unwrap();
        assert_eq!(reporter.battle_url(), "http://backend:8000/battles/b-42");
    }
}
