//! Plate Worker
//!
//! Detection processing service for the plate tracker. Receives LPR webhooks,
//! validates plates against the vehicle registry, keeps one deduplicated record
//! per plate in PostgreSQL and, when video capture is enabled, attaches a clip
//! cut from the rolling segment buffer.
//!
//! ## Features
//!
//! - **Region policy**: strict mode keeps only plates the registry knows;
//!   permissive mode keeps everything and optionally enriches
//! - **Atomic deduplication**: one upsert per sighting, first/last seen times
//!   kept correct under concurrent deliveries
//! - **Evidence clips**: extraction runs in the background after the record
//!   is committed and is attached when it succeeds
//! - **Playback API**: clips and thumbnails served straight from disk, plus a
//!   last-update marker for dashboard polling
//!
//! ## Architecture
//!
//! ```text
//! Camera controller          DVLA API               PostgreSQL
//! ┌──────────────┐          ┌──────────────┐       ┌──────────────────┐
//! │ POST         │          │ vehicle      │       │ license_plates   │
//! │ /webhook     │          │ enquiry      │       │ app_state        │
//! └──────────────┘          └──────────────┘       └──────────────────┘
//!        │                         ▲                        ▲
//!        ▼                         │                        │
//! ┌──────────────┐          ┌──────────────┐       ┌──────────────────┐
//! │ Detection    │─────────▶│ Vehicle      │       │ Plate            │
//! │ Processor    │          │ Registry     │       │ Store            │
//! └──────────────┘          └──────────────┘       └──────────────────┘
//!        │                                                  ▲
//!        ├──────────────────────────────────────────────────┤
//!        ▼                                                  │
//! ┌──────────────┐          ┌──────────────┐               │
//! │ Clip         │─────────▶│ clip dir     │◀── GET /video │
//! │ Extractor    │          │ *.mp4 *.jpg  │               │
//! └──────────────┘          └──────────────┘    attach_video
//! ```

pub mod api;
pub mod config;
pub mod plate;
pub mod plate_store;
pub mod processor;
pub mod registry;

pub use api::{create_router, start_api_server, AppState, ErrorResponse};
pub use config::{Config, ConfigValidationError, RegionMode};
pub use plate::{normalize_plate, PlateObservation, PlateRecord, VehicleAttributes};
pub use plate_store::{PgPlateStore, PlateStore};
pub use processor::{DetectionProcessor, ProcessOutcome, RegionPolicy, ValidationDecision, WebhookPayload};
pub use registry::{DvlaClient, RegistryError, VehicleRegistry};
