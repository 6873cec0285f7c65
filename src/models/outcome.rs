use strum::IntoStaticStr;

/// Classified result of one face-comparison attempt.
///
/// Produced by a [`FaceComparisonClient`](crate::services::collaborators::FaceComparisonClient)
/// and consumed once by the worker that asked for it.
#[derive(Debug, Clone, PartialEq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum VerificationOutcome {
    Matched {
        /// Similarity in percent (0-100).
        confidence: f64,
        /// Batch whose reference photo matched, when the provider searched
        /// more than one.
        found_in_batch: Option<String>,
    },
    NotMatched {
        confidence: f64,
    },
    NoFaceDetected,
    ReferenceImageMissing,
    ProviderError {
        message: String,
    },
}

impl VerificationOutcome {
    pub fn matched(confidence: f64) -> Self {
        Self::Matched {
            confidence,
            found_in_batch: None,
        }
    }

    pub fn provider_error(message: impl Into<String>) -> Self {
        Self::ProviderError {
            message: message.into(),
        }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        self.into()
    }
}
