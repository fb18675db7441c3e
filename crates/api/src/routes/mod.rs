pub mod audio;
pub mod settings;

/// Liveness probe.
pub async fn health() -> &'static str {
    "ok"
}
