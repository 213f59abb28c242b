/*!
 # Reservation source

 Fetches the day's timetable over HTTP and normalizes it.
*/

use async_trait::async_trait;
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::clock::{wait_until, Clock, Wait};
use crate::config::SourceSettings;
use crate::reservation::{normalize, Timeline};
use crate::{Error, Result};

/// Body returned by the reservation endpoint
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReservationPayload {
    /// Time of day -> courts booked in that slot
    pub reservations: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub last_updated: Option<String>,
}

/// Something that can produce the day's reservations
#[async_trait]
pub trait ReservationSource: Send + Sync {
    /// Fetches the raw payload
    async fn fetch(&self) -> Result<ReservationPayload>;

    /// Fetches and normalizes the timetable
    async fn fetch_timeline(&self) -> Result<Timeline> {
        let payload = self.fetch().await?;
        if let Some(updated) = &payload.last_updated {
            debug!("Timetable last updated {}", updated);
        }
        normalize(&payload.reservations)
    }
}

/// The reservation endpoint reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpReservationSource {
    client: reqwest::Client,
    url: String,
    user_agent: String,
}

impl HttpReservationSource {
    pub fn new(settings: &SourceSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout())
            .build()?;
        Ok(Self::with_client(client, settings))
    }

    /// Uses an existing client, e.g. one shared with other requests
    pub fn with_client(client: reqwest::Client, settings: &SourceSettings) -> Self {
        Self {
            client,
            url: settings.url.clone(),
            user_agent: settings.user_agent.clone(),
        }
    }
}

#[async_trait]
impl ReservationSource for HttpReservationSource {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn fetch(&self) -> Result<ReservationPayload> {
        let response = self
            .client
            .get(&self.url)
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, &self.user_agent)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Fetch(format!("{} returned {}", self.url, status)));
        }

        let payload = response.json::<ReservationPayload>().await?;
        debug!("Fetched {} timetable entries", payload.reservations.len());
        Ok(payload)
    }
}

/// Fetches the timetable up to `attempts` times, `delay` apart.
///
/// Transport errors, malformed entries and empty timetables all count as a
/// failed attempt. Returns `None` once every attempt failed or shutdown was
/// requested while waiting to retry.
#[instrument(skip(source, clock, shutdown))]
pub async fn fetch_with_retry<S, C>(
    source: &S,
    clock: &C,
    attempts: u32,
    delay: Duration,
    shutdown: &CancellationToken,
) -> Option<Timeline>
where
    S: ReservationSource + ?Sized,
    C: Clock + ?Sized,
{
    for attempt in 1..=attempts {
        let result = match source.fetch_timeline().await {
            Ok(timeline) if timeline.is_empty() => Err(Error::EmptySchedule),
            other => other,
        };

        match result {
            Ok(timeline) => {
                info!("Fetched {} reservations", timeline.len());
                return Some(timeline);
            }
            Err(e) => {
                error!(
                    "Failed to fetch reservations. Attempt {}/{}: {}",
                    attempt, attempts, e
                );
            }
        }

        if attempt < attempts {
            let retry_at = clock.now() + crate::clock::to_chrono(delay);
            if wait_until(clock, retry_at, shutdown).await == Wait::Interrupted {
                return None;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::NaiveDate;
    use parking_lot::Mutex;

    /// Serves queued responses in order, then keeps failing
    struct Scripted {
        responses: Mutex<Vec<Result<ReservationPayload>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(mut responses: Vec<Result<ReservationPayload>>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl ReservationSource for Scripted {
        async fn fetch(&self) -> Result<ReservationPayload> {
            *self.calls.lock() += 1;
            self.responses
                .lock()
                .pop()
                .unwrap_or_else(|| Err(Error::Fetch("exhausted".into())))
        }
    }

    fn payload(entries: &[(&str, &str)]) -> ReservationPayload {
        ReservationPayload {
            reservations: entries
                .iter()
                .map(|(t, c)| (t.to_string(), vec![c.to_string()]))
                .collect(),
            last_updated: Some("2024-09-01 02:52:29".into()),
        }
    }

    fn clock() -> ManualClock {
        ManualClock::new(
            NaiveDate::from_ymd_opt(2024, 9, 2)
                .unwrap()
                .and_hms_opt(4, 10, 0)
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn second_attempt_after_delay() {
        let source = Scripted::new(vec![
            Err(Error::Fetch("connection refused".into())),
            Ok(payload(&[("05:30", "Half Court A")])),
        ]);
        let clock = clock();
        let start = clock.now();

        let timeline = fetch_with_retry(
            &source,
            &clock,
            2,
            Duration::from_secs(300),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(timeline.len(), 1);
        assert_eq!(*source.calls.lock(), 2);
        assert_eq!(clock.now() - start, chrono::Duration::minutes(5));
    }

    #[tokio::test]
    async fn gives_up_after_the_last_attempt_without_waiting() {
        let source = Scripted::new(vec![]);
        let clock = clock();
        let start = clock.now();

        let result = fetch_with_retry(
            &source,
            &clock,
            2,
            Duration::from_secs(300),
            &CancellationToken::new(),
        )
        .await;

        assert!(result.is_none());
        assert_eq!(*source.calls.lock(), 2);
        assert_eq!(clock.now() - start, chrono::Duration::minutes(5));
    }

    #[tokio::test]
    async fn malformed_and_empty_timetables_are_retried() {
        let source = Scripted::new(vec![
            Ok(payload(&[("half past five", "Full Court")])),
            Ok(payload(&[])),
            Ok(payload(&[("21:30", "Full Court")])),
        ]);
        let result = fetch_with_retry(
            &source,
            &clock(),
            3,
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(result.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_abandons_the_retry_wait() {
        let source = Scripted::new(vec![]);
        let token = CancellationToken::new();
        token.cancel();
        let result = fetch_with_retry(&source, &clock(), 2, Duration::from_secs(300), &token).await;
        assert!(result.is_none());
        assert_eq!(*source.calls.lock(), 1);
    }
}
