//! Cached TTS audio
//!
//! The output router hands the home-automation controller a URL to this
//! endpoint when a reply plays on a controller-attached speaker.

use crate::AppContext;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;

pub async fn get_cached_audio(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let id = id.strip_suffix(".wav").unwrap_or(&id);
    match ctx.tts_cache.get(id) {
        Some(audio) => {
            ([(header::CONTENT_TYPE, "audio/wav")], audio).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
