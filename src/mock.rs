/*!
 # Mock reservation server

 Serves a fixed timetable in the same shape as the real reservation
 endpoint, for running `courtd` without the booking system.
*/

use axum::{routing::get, Json, Router};
use std::collections::BTreeMap;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::source::ReservationPayload;
use crate::Result;

/// The fixture timetable, trailing sub-label periods included
pub fn fixture() -> ReservationPayload {
    let entries: [(&str, &[&str]); 17] = [
        ("05:30", &["Half Court A"]),
        ("06:30", &["Half Court B"]),
        ("07:30", &["Half Court B.", "Half Court A."]),
        ("08:30", &["Full Court"]),
        ("09:30", &["Full Court"]),
        ("10:30", &["Full Court"]),
        ("11:30", &["Full Court"]),
        ("12:30", &["Full Court"]),
        ("13:30", &["Full Court"]),
        ("14:30", &["Full Court"]),
        ("15:30", &["Full Court"]),
        ("16:30", &["Full Court"]),
        ("17:30", &["Full Court"]),
        ("18:30", &["Half Court A.", "Half Court B."]),
        ("19:30", &["Half Court A.", "Half Court B."]),
        ("20:30", &["Half Court B."]),
        ("21:30", &["Full Court"]),
    ];

    let reservations: BTreeMap<String, Vec<String>> = entries
        .iter()
        .map(|(time, courts)| {
            (
                time.to_string(),
                courts.iter().map(|c| c.to_string()).collect(),
            )
        })
        .collect();

    ReservationPayload {
        reservations,
        last_updated: Some("2024-09-01 02:52:29".into()),
    }
}

async fn reservations() -> Json<ReservationPayload> {
    Json(fixture())
}

pub fn router() -> Router {
    Router::new().route("/reservations", get(reservations))
}

/// Serves the fixture on `bind` until `shutdown` is cancelled
pub async fn serve(bind: &str, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!("Mock reservation server listening on {}", listener.local_addr()?);
    axum::serve(listener, router())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
