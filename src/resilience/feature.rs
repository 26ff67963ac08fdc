use serde::{Deserialize, Serialize};
use std::fmt;

/// Protected capabilities guarded by a circuit breaker
///
/// The set is closed at compile time; every feature has a default
/// [`ResiliencePolicy`](crate::policy::ResiliencePolicy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Feature {
    /// Handwritten answer-sheet and document OCR
    AiOcr,
    /// Generated student performance insights
    AiInsights,
    /// Online fee collection
    PaymentGateway,
    /// SMS notifications to guardians and staff
    SmsGateway,
    /// Transactional email
    EmailDelivery,
    /// Dashboard and report aggregation
    AnalyticsEngine,
    /// PDF/CSV/XLSX rendering of reports and inspections
    DocumentExport,
    /// Hand-off of background jobs to the external broker
    JobQueue,
}

impl Feature {
    pub const ALL: [Feature; 8] = [
        Feature::AiOcr,
        Feature::AiInsights,
        Feature::PaymentGateway,
        Feature::SmsGateway,
        Feature::EmailDelivery,
        Feature::AnalyticsEngine,
        Feature::DocumentExport,
        Feature::JobQueue,
    ];

    /// Stable identifier used in configuration, logs and fallback payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AiOcr => "AI_OCR",
            Self::AiInsights => "AI_INSIGHTS",
            Self::PaymentGateway => "PAYMENT_GATEWAY",
            Self::SmsGateway => "SMS_GATEWAY",
            Self::EmailDelivery => "EMAIL_DELIVERY",
            Self::AnalyticsEngine => "ANALYTICS_ENGINE",
            Self::DocumentExport => "DOCUMENT_EXPORT",
            Self::JobQueue => "JOB_QUEUE",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|feature| feature.as_str() == normalized)
            .ok_or_else(|| format!("Unknown feature: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_identifiers_round_trip() {
        for feature in Feature::ALL {
            assert_eq!(feature.as_str().parse::<Feature>().unwrap(), feature);
        }
        assert_eq!("ai_ocr".parse::<Feature>().unwrap(), Feature::AiOcr);
        assert!("TELEPORTER".parse::<Feature>().is_err());
    }

    #[test]
    fn test_feature_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&Feature::PaymentGateway).unwrap();
        assert_eq!(json, "\"PAYMENT_GATEWAY\"");
    }
}
