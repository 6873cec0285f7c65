use garde::Validate;
use serde::{Deserialize, Serialize};

/// Text fields of a face-video attendance submission (multipart body).
#[derive(Debug, Default, Deserialize, Validate)]
pub struct SubmitRequest {
    #[garde(length(min = 1, max = 50), pattern(r"^[A-Za-z0-9_-]+$"))]
    pub student_id: String,

    #[garde(length(min = 6, max = 6), pattern(r"^[0-9]+$"))]
    pub otp: String,

    #[garde(range(min = 1))]
    pub chat_user_id: i64,

    #[garde(custom(finite), range(min = -90.0, max = 90.0))]
    pub latitude: f64,

    #[garde(custom(finite), range(min = -180.0, max = 180.0))]
    pub longitude: f64,
}

// NaN slips through `range` since every comparison with it is false.
fn finite(value: &f64, _: &()) -> garde::Result {
    if value.is_finite() {
        Ok(())
    } else {
        Err(garde::Error::new("must be a finite number"))
    }
}

/// Response after submitting a face video for verification.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub request_id: String,
    pub status: String,
    pub message: String,
}
