//! Face-verified classroom attendance.
//!
//! Students submit a short face video against a teacher's OTP session. Each
//! submission becomes a job on an autoscaling, rate-limited verification
//! queue that compares the face with a stored reference photo, records
//! attendance at most once per student and session, and replies in chat.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
