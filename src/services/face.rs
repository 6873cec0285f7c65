use async_trait::async_trait;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::models::outcome::VerificationOutcome;
use crate::services::collaborators::FaceComparisonClient;
use crate::services::frames::FrameExtractor;
use crate::services::storage::{ReferenceImageStore, StorageError};

/// Reference photos above this size are downscaled before upload.
const MAX_UPLOAD_BYTES: usize = 100_000;
const DOWNSCALE_EDGE: u32 = 150;
const DOWNSCALE_JPEG_QUALITY: u8 = 50;

/// Client for a CompareFaces-style face similarity endpoint.
///
/// The reference photo is fetched from object storage; one still frame of
/// the submitted clip goes to the provider as the target image.
pub struct HttpFaceClient {
    http: Client,
    endpoint: String,
    api_token: String,
    threshold: f64,
    references: Arc<ReferenceImageStore>,
    frames: Arc<dyn FrameExtractor>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CompareFacesRequest {
    source_image: ImageBlob,
    target_image: ImageBlob,
    similarity_threshold: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ImageBlob {
    bytes: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CompareFacesResponse {
    #[serde(default)]
    face_matches: Vec<FaceMatch>,
    #[serde(default)]
    unmatched_faces: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FaceMatch {
    similarity: f64,
}

#[derive(Debug, Deserialize)]
struct ProviderFault {
    #[serde(default, alias = "__type", alias = "Code")]
    code: String,
}

impl HttpFaceClient {
    pub fn new(
        endpoint: String,
        api_token: String,
        threshold: f64,
        references: Arc<ReferenceImageStore>,
        frames: Arc<dyn FrameExtractor>,
        timeout: Duration,
    ) -> Result<Self, FaceClientError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint,
            api_token,
            threshold,
            references,
            frames,
        })
    }

    /// Look for the student's photo in each listed batch, in order.
    async fn find_reference(
        &self,
        student_id: &str,
        batches: &str,
    ) -> Result<Option<(String, Vec<u8>)>, StorageError> {
        for batch in batches.split(',').map(str::trim).filter(|b| !b.is_empty()) {
            if let Some(bytes) = self.references.fetch_reference(batch, student_id).await? {
                return Ok(Some((batch.to_string(), bytes)));
            }
            tracing::debug!(student_id, batch, "No reference photo in batch");
        }
        Ok(None)
    }

    async fn compare_bytes(
        &self,
        reference: &[u8],
        frame: &[u8],
    ) -> Result<Option<CompareFacesResponse>, FaceClientError> {
        let engine = base64::engine::general_purpose::STANDARD;
        let request = CompareFacesRequest {
            source_image: ImageBlob {
                bytes: engine.encode(downscale_if_large(reference)),
            },
            target_image: ImageBlob {
                bytes: engine.encode(frame),
            },
            // Similarity is judged locally so near-misses still report a score.
            similarity_threshold: 0.0,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_token)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            return Ok(Some(serde_json::from_str(&body)?));
        }
        if status == StatusCode::BAD_REQUEST && is_no_face_fault(&body) {
            return Ok(None);
        }
        Err(FaceClientError::Status {
            status: status.as_u16(),
            body: body.chars().take(200).collect(),
        })
    }
}

/// Map a comparison response onto an outcome using the local threshold.
fn classify(response: &CompareFacesResponse, threshold: f64, batch: String) -> VerificationOutcome {
    let best = response
        .face_matches
        .iter()
        .map(|m| m.similarity)
        .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.max(s))));

    match best {
        Some(similarity) if similarity >= threshold => VerificationOutcome::Matched {
            confidence: similarity,
            found_in_batch: Some(batch),
        },
        Some(similarity) => VerificationOutcome::NotMatched {
            confidence: similarity,
        },
        None if response.unmatched_faces.is_empty() => VerificationOutcome::NoFaceDetected,
        None => VerificationOutcome::NotMatched { confidence: 0.0 },
    }
}

#[async_trait]
impl FaceComparisonClient for HttpFaceClient {
    async fn compare(&self, student_id: &str, batch: &str, media: &[u8]) -> VerificationOutcome {
        let frame = match self.frames.extract(media).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::info!(student_id, "Could not extract a frame from the submitted video");
                return VerificationOutcome::NoFaceDetected;
            }
            Err(e) => return VerificationOutcome::provider_error(format!("frame extraction: {e}")),
        };

        let (found_batch, reference) = match self.find_reference(student_id, batch).await {
            Ok(Some(found)) => found,
            Ok(None) => return VerificationOutcome::ReferenceImageMissing,
            Err(e) => return VerificationOutcome::provider_error(format!("reference lookup: {e}")),
        };

        match self.compare_bytes(&reference, &frame).await {
            Ok(Some(response)) => classify(&response, self.threshold, found_batch),
            Ok(None) => VerificationOutcome::NoFaceDetected,
            Err(e) => VerificationOutcome::provider_error(e.to_string()),
        }
    }
}

fn is_no_face_fault(body: &str) -> bool {
    serde_json::from_str::<ProviderFault>(body)
        .map(|fault| fault.code.ends_with("InvalidParameterException"))
        .unwrap_or(false)
}

/// Shrink large still images to a small JPEG. Anything that is not a
/// decodable image is passed through untouched.
fn downscale_if_large(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() <= MAX_UPLOAD_BYTES || image::guess_format(bytes).is_err() {
        return bytes.to_vec();
    }

    let shrunk = image::load_from_memory(bytes).ok().and_then(|img| {
        let small = img.resize_exact(DOWNSCALE_EDGE, DOWNSCALE_EDGE, FilterType::Triangle);
        let rgb = DynamicImage::ImageRgb8(small.to_rgb8());
        let mut out = Vec::new();
        rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, DOWNSCALE_JPEG_QUALITY))
            .ok()
            .map(|_| out)
    });
    shrunk.unwrap_or_else(|| bytes.to_vec())
}

#[derive(Debug, thiserror::Error)]
pub enum FaceClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to parse comparison response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Comparison endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::frames::FrameError;
    use crate::services::rate_limiter::RateLimiter;
    use httpmock::prelude::*;
    use serde_json::json;

    /// Extractor answering with a fixed frame (or none).
    struct FixedFrame(Option<Vec<u8>>);

    #[async_trait]
    impl FrameExtractor for FixedFrame {
        async fn extract(&self, _media: &[u8]) -> Result<Option<Vec<u8>>, FrameError> {
            Ok(self.0.clone())
        }
    }

    /// Client against `server` with a cached reference photo for S1 in B2.
    fn client(server: &MockServer, frame: Option<Vec<u8>>) -> HttpFaceClient {
        let references = ReferenceImageStore::new(
            "faces",
            "http://127.0.0.1:9",
            "us-east-1",
            "key",
            "secret",
            RateLimiter::per_second(100),
        )
        .unwrap();
        references.preload("B2", "S1", b"reference-jpeg".to_vec());

        HttpFaceClient::new(
            server.url("/compare"),
            "face-token".into(),
            50.0,
            Arc::new(references),
            Arc::new(FixedFrame(frame)),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn classify_json(threshold: f64, json: &str) -> VerificationOutcome {
        let response: CompareFacesResponse = serde_json::from_str(json).unwrap();
        classify(&response, threshold, "B1".into())
    }

    #[test]
    fn test_parses_best_match() {
        let outcome = classify_json(
            50.0,
            r#"{"FaceMatches":[{"Similarity":41.0},{"Similarity":97.5}],"UnmatchedFaces":[]}"#,
        );
        assert_eq!(
            outcome,
            VerificationOutcome::Matched {
                confidence: 97.5,
                found_in_batch: Some("B1".into())
            }
        );
    }

    #[test]
    fn test_below_threshold_is_not_matched() {
        let outcome = classify_json(50.0, r#"{"FaceMatches":[{"Similarity":31.0}]}"#);
        assert_eq!(outcome, VerificationOutcome::NotMatched { confidence: 31.0 });
    }

    #[test]
    fn test_no_faces_at_all() {
        assert_eq!(classify_json(50.0, "{}"), VerificationOutcome::NoFaceDetected);
        assert_eq!(
            classify_json(50.0, r#"{"UnmatchedFaces":[{"Confidence":99.0}]}"#),
            VerificationOutcome::NotMatched { confidence: 0.0 }
        );
    }

    #[test]
    fn test_no_face_fault_detection() {
        assert!(is_no_face_fault(
            r#"{"__type":"InvalidParameterException","message":"no face"}"#
        ));
        assert!(is_no_face_fault(r#"{"Code":"InvalidParameterException"}"#));
        assert!(!is_no_face_fault(r#"{"__type":"ThrottlingException"}"#));
        assert!(!is_no_face_fault("not json"));
    }

    #[test]
    fn test_small_or_non_image_payload_passes_through() {
        let opaque = vec![0u8; MAX_UPLOAD_BYTES + 10];
        assert_eq!(downscale_if_large(&opaque), opaque);
        let tiny = b"tiny".to_vec();
        assert_eq!(downscale_if_large(&tiny), tiny);
    }

    #[test]
    fn test_large_image_is_downscaled() {
        // Hash-based noise so PNG cannot compress it below the threshold.
        let img = image::RgbImage::from_fn(600, 600, |x, y| {
            let v = (x.wrapping_mul(2_654_435_761) ^ y.wrapping_mul(40_503))
                .wrapping_mul(2_246_822_519);
            image::Rgb([v as u8, (v >> 8) as u8, (v >> 16) as u8])
        });
        let mut png = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        assert!(png.len() > MAX_UPLOAD_BYTES);

        let out = downscale_if_large(&png);
        assert!(out.len() < png.len());
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (150, 150));
    }

    #[tokio::test]
    async fn test_match_reports_batch_the_reference_was_found_in() {
        let server = MockServer::start_async().await;
        let compare = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/compare")
                    .header("authorization", "Bearer face-token");
                then.status(200)
                    .json_body(json!({"FaceMatches": [{"Similarity": 93.5}], "UnmatchedFaces": []}));
            })
            .await;

        let face = client(&server, Some(b"frame-jpeg".to_vec()));
        let outcome = face.compare("S1", "B2", b"clip").await;

        compare.assert_async().await;
        assert_eq!(
            outcome,
            VerificationOutcome::Matched {
                confidence: 93.5,
                found_in_batch: Some("B2".into())
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_parameter_fault_is_no_face() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/compare");
                then.status(400).json_body(json!({
                    "__type": "InvalidParameterException",
                    "Message": "There are no faces in the image"
                }));
            })
            .await;

        let outcome = client(&server, Some(b"frame-jpeg".to_vec()))
            .compare("S1", "B2", b"clip")
            .await;
        assert_eq!(outcome, VerificationOutcome::NoFaceDetected);
    }

    #[tokio::test]
    async fn test_server_error_is_provider_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/compare");
                then.status(500).body("internal error");
            })
            .await;

        let outcome = client(&server, Some(b"frame-jpeg".to_vec()))
            .compare("S1", "B2", b"clip")
            .await;
        match outcome {
            VerificationOutcome::ProviderError { message } => assert!(message.contains("500")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_undecodable_video_is_no_face_without_calling_provider() {
        let server = MockServer::start_async().await;
        let compare = server
            .mock_async(|when, then| {
                when.method(POST).path("/compare");
                then.status(200).json_body(json!({"FaceMatches": []}));
            })
            .await;

        let outcome = client(&server, None).compare("S1", "B2", b"not a video").await;

        assert_eq!(outcome, VerificationOutcome::NoFaceDetected);
        assert_eq!(compare.hits_async().await, 0);
    }
}
