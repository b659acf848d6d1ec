//! Still camera: grab a JPEG with an external capture command and post it
//! to the plant-detection endpoint as a multipart upload.
//!
//! `capture_and_upload` returns as soon as the job is handed to a worker
//! thread. While a job is in flight further requests fail with
//! [`DriverError::Busy`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::DriverError;

/// Clears the busy flag when the upload thread finishes, however it ends.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Camera {
    command: Vec<String>,
    upload_url: String,
    busy: Arc<AtomicBool>,
}

impl Camera {
    /// `command` is argv of a program that writes one JPEG frame to stdout,
    /// e.g. `fswebcam -q --no-banner -r 1280x720 --jpeg 85 -`.
    pub fn new(command: Vec<String>, upload_url: String) -> Result<Self, DriverError> {
        if command.is_empty() {
            return Err(DriverError::Malformed("empty camera capture command".into()));
        }
        tracing::info!(program = %command[0], url = %upload_url, "camera configured");
        Ok(Self {
            command,
            upload_url,
            busy: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn capture_and_upload(&self) -> Result<(), DriverError> {
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(DriverError::Busy);
        }
        let guard = BusyGuard(Arc::clone(&self.busy));
        let command = self.command.clone();
        let url = self.upload_url.clone();

        thread::Builder::new()
            .name("camera-upload".into())
            .spawn(move || {
                let _guard = guard;
                match run_job(&command, &url) {
                    Ok(bytes) => tracing::info!(bytes, "image uploaded"),
                    Err(e) => tracing::warn!("camera job failed: {e}"),
                }
            })?;
        Ok(())
    }
}

#[cfg(feature = "hardware")]
fn run_job(command: &[String], url: &str) -> Result<usize, DriverError> {
    use reqwest::blocking::{multipart, Client};

    let output = std::process::Command::new(&command[0])
        .args(&command[1..])
        .output()?;
    if !output.status.success() || output.stdout.is_empty() {
        return Err(DriverError::Malformed(format!(
            "capture command exited with {}",
            output.status
        )));
    }
    let len = output.stdout.len();

    let part = multipart::Part::bytes(output.stdout)
        .file_name("image.jpg")
        .mime_str("image/jpeg")
        .map_err(|e| DriverError::Upload(e.to_string()))?;
    let form = multipart::Form::new().part("file", part);

    let res = Client::new()
        .post(url)
        .multipart(form)
        .send()
        .map_err(|e| DriverError::Upload(e.to_string()))?;
    if !res.status().is_success() {
        return Err(DriverError::Upload(format!("server answered {}", res.status())));
    }
    Ok(len)
}

/// Stand-in job: pretend to capture and upload a ~120 kB frame.
#[cfg(not(feature = "hardware"))]
fn run_job(command: &[String], url: &str) -> Result<usize, DriverError> {
    tracing::debug!(program = %command[0], url, "[sim] capturing frame");
    thread::sleep(std::time::Duration::from_millis(300));
    Ok(crate::sim::bounded(120_000.0, 5_000.0, 1.0, 1e6) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_rejected() {
        assert!(Camera::new(Vec::new(), "http://localhost/api".into()).is_err());
    }

    #[cfg(not(feature = "hardware"))]
    #[test]
    fn second_request_while_uploading_is_busy() {
        let cam = Camera::new(vec!["fswebcam".into(), "-".into()], "http://localhost/api".into())
            .unwrap();
        cam.capture_and_upload().unwrap();
        assert!(matches!(cam.capture_and_upload(), Err(DriverError::Busy)));

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while cam.is_busy() && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(!cam.is_busy());
        cam.capture_and_upload().unwrap();
    }
}
