use crate::config::RegionMode;
use crate::plate::{normalize_plate, PlateObservation, VehicleAttributes};
use crate::plate_store::PlateStore;
use crate::registry::VehicleRegistry;
use base64::Engine;
use chrono::{DateTime, Utc};
use plate_capture::{ClipCapture, ClipRequest};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// LPR webhook body as sent by the camera controller.
///
/// Only the fields the pipeline uses are modelled; everything else in the
/// payload is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub alarm: Option<Alarm>,
    /// Flat plate field sent by older integrations
    #[serde(default)]
    pub plate_number: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Alarm {
    #[serde(default)]
    pub triggers: Vec<AlarmTrigger>,
    /// Base64 (optionally data-URI) snapshot of the vehicle
    #[serde(default)]
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlarmTrigger {
    #[serde(default)]
    pub value: Option<String>,
}

impl WebhookPayload {
    /// Raw plate reading: the first alarm trigger, else the flat field.
    pub fn plate(&self) -> Option<&str> {
        self.alarm
            .as_ref()
            .and_then(|a| a.triggers.first())
            .and_then(|t| t.value.as_deref())
            .or(self.plate_number.as_deref())
    }

    pub fn thumbnail(&self) -> Option<&str> {
        self.alarm.as_ref().and_then(|a| a.thumbnail.as_deref())
    }
}

/// Keep an embedded image only if it is well-formed base64.
fn validate_image(raw: &str) -> Option<String> {
    let encoded = match raw.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => raw,
    };
    match base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
        Ok(bytes) if !bytes.is_empty() => Some(raw.to_string()),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "Dropping malformed detection thumbnail");
            None
        }
    }
}

/// Validation policy applied to every sanitized plate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionPolicy {
    pub mode: RegionMode,
    /// Consult the registry for permissive-mode plates
    pub enrich: bool,
}

/// Outcome of validating a plate against the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationDecision {
    /// Keep the detection, with whatever details the registry returned
    Accept { attributes: Option<VehicleAttributes> },
    /// Drop the detection
    Reject { reason: String },
}

/// What happened to one webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// No usable plate in the payload
    Ignored,
    /// Plate failed validation; nothing was written
    Rejected { plate: String, reason: String },
    /// Plate record written
    Persisted { plate: String, clip_requested: bool },
    /// Plate accepted but the write failed
    Failed { plate: String },
}

/// Turns detection webhooks into persisted plate records and clip requests.
pub struct DetectionProcessor {
    store: Arc<dyn PlateStore>,
    registry: Option<Arc<dyn VehicleRegistry>>,
    policy: RegionPolicy,
    clips: Option<Arc<dyn ClipCapture>>,
    tasks: TaskTracker,
}

impl DetectionProcessor {
    pub fn new(
        store: Arc<dyn PlateStore>,
        registry: Option<Arc<dyn VehicleRegistry>>,
        policy: RegionPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            policy,
            clips: None,
            tasks: TaskTracker::new(),
        }
    }

    /// Request a clip for every persisted detection.
    pub fn with_clip_capture(mut self, clips: Arc<dyn ClipCapture>) -> Self {
        self.clips = Some(clips);
        self
    }

    pub fn video_capture_enabled(&self) -> bool {
        self.clips.is_some()
    }

    pub fn region_mode(&self) -> RegionMode {
        self.policy.mode
    }

    /// Detections and clip extractions still in flight.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Process a detection on the processor's own task tracker. Dropping the
    /// caller does not cancel it; `shutdown()` waits for it.
    pub fn submit(self: &Arc<Self>, payload: WebhookPayload, received_at: DateTime<Utc>) {
        let processor = self.clone();
        self.tasks.spawn(async move {
            let outcome = processor.handle(&payload, received_at).await;
            debug!(outcome = ?outcome, "Detection processed");
        });
    }

    /// Process one detection received at `received_at`.
    #[instrument(skip(self, payload))]
    pub async fn handle(&self, payload: &WebhookPayload, received_at: DateTime<Utc>) -> ProcessOutcome {
        metrics::counter!("lpr.webhooks.received").increment(1);

        let Some(plate) = payload.plate().and_then(normalize_plate) else {
            info!("Ignoring detection without a usable plate");
            metrics::counter!("lpr.detections.ignored").increment(1);
            return ProcessOutcome::Ignored;
        };

        let attributes = match self.validate(&plate).await {
            ValidationDecision::Accept { attributes } => attributes,
            ValidationDecision::Reject { reason } => {
                warn!(plate = %plate, reason = %reason, "Detection rejected");
                metrics::counter!("lpr.detections.rejected").increment(1);
                return ProcessOutcome::Rejected { plate, reason };
            }
        };

        let observation = PlateObservation {
            plate: plate.clone(),
            captured_at: received_at,
            image: payload.thumbnail().and_then(validate_image),
            attributes,
        };

        match self.store.record_observation(&observation).await {
            Ok(record) => {
                info!(
                    plate = %plate,
                    id = record.id,
                    first_seen = %record.capture_time,
                    enriched = observation.attributes.is_some(),
                    "Plate recorded"
                );
            }
            Err(e) => {
                error!(plate = %plate, error = ?e, "Failed to persist plate");
                metrics::counter!("lpr.persist.failed").increment(1);
                return ProcessOutcome::Failed { plate };
            }
        }

        let clip_requested = self.request_clip(&plate, received_at);
        ProcessOutcome::Persisted {
            plate,
            clip_requested,
        }
    }

    /// Apply the region policy to a normalized plate.
    pub async fn validate(&self, plate: &str) -> ValidationDecision {
        match self.policy.mode {
            RegionMode::Strict => {
                let Some(registry) = &self.registry else {
                    return ValidationDecision::Reject {
                        reason: "registry not configured".to_string(),
                    };
                };
                match registry.lookup(plate).await {
                    Ok(attributes) => ValidationDecision::Accept {
                        attributes: Some(attributes),
                    },
                    Err(e) if e.is_not_found() => ValidationDecision::Reject {
                        reason: "not found in registry".to_string(),
                    },
                    Err(e) => {
                        error!(plate = %plate, error = %e, "Registry lookup failed");
                        ValidationDecision::Reject {
                            reason: format!("registry unavailable: {}", e),
                        }
                    }
                }
            }
            RegionMode::Permissive => {
                let registry = match &self.registry {
                    Some(registry) if self.policy.enrich => registry,
                    _ => return ValidationDecision::Accept { attributes: None },
                };
                match registry.lookup(plate).await {
                    Ok(attributes) => ValidationDecision::Accept {
                        attributes: Some(attributes),
                    },
                    Err(e) => {
                        if e.is_not_found() {
                            debug!(plate = %plate, "Plate not in registry, keeping without details");
                        } else {
                            warn!(plate = %plate, error = %e, "Registry enrichment failed");
                        }
                        ValidationDecision::Accept { attributes: None }
                    }
                }
            }
        }
    }

    /// Spawn clip extraction for a persisted plate, if capture is enabled.
    fn request_clip(&self, plate: &str, event_time: DateTime<Utc>) -> bool {
        let Some(clips) = self.clips.clone() else {
            return false;
        };
        let store = self.store.clone();
        let request = ClipRequest {
            plate: plate.to_string(),
            event_time,
        };

        self.tasks.spawn(async move {
            let plate = request.plate.clone();
            let event_time = request.event_time;
            let Some(clip) = clips.capture(request).await else {
                debug!(plate = %plate, "No clip produced");
                return;
            };

            match store.attach_video(&plate, &clip.filename, event_time).await {
                Ok(true) => info!(plate = %plate, clip = %clip.filename, "Clip attached"),
                Ok(false) => warn!(
                    plate = %plate,
                    clip = %clip.filename,
                    "Clip not attached: plate unknown or a later clip is already attached"
                ),
                Err(e) => error!(plate = %plate, error = ?e, "Failed to attach clip"),
            }
        });

        true
    }

    /// Wait for in-flight detections and clip extractions.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}
