pub mod clustering;
pub mod config;
pub mod digest;
pub mod error;
pub mod fact_source;
pub mod facts;
pub mod feature_store;
pub mod features;
pub mod jobs;
pub mod model_registry;
pub mod persona_assigner;
pub mod persona_model;
pub mod persona_trainer;
pub mod pipeline;
pub mod quality_gate;
pub mod riot_match;
pub mod snapshot;
pub mod store;
pub mod telemetry;
pub mod workers;
