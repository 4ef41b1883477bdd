use crate::config::LoggingConfig;
use crate::logger::types::{DecisionLogEntry, DecisionLogSink};
use crate::model::DecisionCode;
use tracing::info;

pub struct ConsoleLogSink {
    config: LoggingConfig,
}

impl ConsoleLogSink {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }

    fn should_log(&self, entry: &DecisionLogEntry) -> bool {
        if !self.config.enable {
            return false;
        }
        match entry.decision {
            // Uncertain answers are always worth a line.
            DecisionCode::Uncertain => true,
            DecisionCode::Blocked => self.config.log_blocked || self.config.log_all_checks,
            DecisionCode::NotBlocked => self.config.log_all_checks,
        }
    }
}

impl DecisionLogSink for ConsoleLogSink {
    fn log(&self, entry: &DecisionLogEntry) {
        if !self.should_log(entry) {
            return;
        }

        if self.config.format == "json" {
            info!(
                target: "decision",
                phone = %entry.phone_number,
                decision = entry.decision.as_str(),
                blocked = entry.is_blocked,
                risk = entry.risk_score,
                severity = ?entry.highest_severity,
                sources = ?entry.sources,
                codes = ?entry.compliance_codes,
                cache_hit = entry.cache_hit,
                lat_us = entry.latency_us,
                warnings = entry.warnings
            );
        } else {
            let outcome = match entry.decision {
                DecisionCode::Blocked => format!("blocked by {}", entry.compliance_codes.join(", ")),
                DecisionCode::NotBlocked => "allowed".to_string(),
                DecisionCode::Uncertain => {
                    format!("uncertain ({} provider warnings)", entry.warnings)
                }
            };
            info!(
                "[check] {} -> {} risk={:.2}{} [{}us]",
                entry.phone_number,
                outcome,
                entry.risk_score,
                if entry.cache_hit { " (cached)" } else { "" },
                entry.latency_us
            );
        }
    }
}
