pub mod anchors;
pub mod config;
pub mod gemini;
pub mod generator;
pub mod guardrails;
pub mod models;
pub mod normalize;
pub mod providers;
pub mod quota;
pub mod routes;
pub mod security;
pub mod similarity;
pub mod telemetry;
