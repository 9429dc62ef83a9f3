use crate::alerts::AlertResult;
use crate::poller::Observer;
use async_trait::async_trait;
use tracing::warn;

/// Turns freshly triggered alerts into warn-level log lines.
#[derive(Debug, Default)]
pub struct LogNotifier;

/// Message text for every result that fired this tick.
fn notifications(results: &[AlertResult]) -> impl Iterator<Item = (&AlertResult, String)> {
    results
        .iter()
        .filter(|r| r.is_triggered)
        .map(|r| (r, r.notification_text()))
}

#[async_trait]
impl Observer for LogNotifier {
    async fn on_alerts(&self, results: &[AlertResult]) {
        for (result, text) in notifications(results) {
            warn!(
                metric = %result.rule.metric,
                value = result.current_value,
                threshold = result.rule.threshold,
                "{text}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertRule, CompareDirection, MetricType};

    #[test]
    fn only_triggered_results_notify() {
        let results = [
            AlertResult {
                rule: AlertRule::new(MetricType::CpuUsage, 90.0, CompareDirection::Above),
                current_value: 97.04,
                is_triggered: true,
            },
            AlertResult {
                rule: AlertRule::new(MetricType::GpuTemp, 85.0, CompareDirection::Above),
                current_value: 88.0,
                is_triggered: false,
            },
        ];
        let texts: Vec<String> = notifications(&results).map(|(_, text)| text).collect();
        assert_eq!(
            texts,
            vec!["CPU usage alert: current 97.0% above threshold 90.0%".to_string()]
        );
    }
}
