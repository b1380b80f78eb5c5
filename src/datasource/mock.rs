//! Mock event source for testing without network calls.

use super::{DataSourceError, EventPage, EventSource};
use crate::domain::{Address, RawEvent, TimeMs};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory event source with failure and duplicate-delivery injection.
#[derive(Debug, Clone, Default)]
pub struct MockEventSource {
    events: HashMap<Address, Vec<RawEvent>>,
    /// Remaining injected failures per wallet.
    failures: Arc<Mutex<HashMap<Address, (u32, DataSourceError)>>>,
    duplicate_delivery: bool,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
}

impl MockEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event observed for `wallet`.
    pub fn with_event(mut self, wallet: &Address, event: RawEvent) -> Self {
        self.events.entry(wallet.clone()).or_default().push(event);
        self
    }

    pub fn with_events(mut self, wallet: &Address, events: Vec<RawEvent>) -> Self {
        self.events.entry(wallet.clone()).or_default().extend(events);
        self
    }

    /// Fail the next `times` calls for `wallet` with `error`.
    pub fn with_failures(self, wallet: &Address, times: u32, error: DataSourceError) -> Self {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(wallet.clone(), (times, error));
        }
        self
    }

    /// Deliver every event twice within its page.
    pub fn with_duplicate_delivery(mut self) -> Self {
        self.duplicate_delivery = true;
        self
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Total fetch calls served so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn take_failure(&self, wallet: &Address) -> Option<DataSourceError> {
        let mut failures = self.failures.lock().ok()?;
        let entry = failures.get_mut(wallet)?;
        if entry.0 == 0 {
            return None;
        }
        entry.0 -= 1;
        Some(entry.1.clone())
    }
}

#[async_trait]
impl EventSource for MockEventSource {
    async fn fetch_events(
        &self,
        wallet: &Address,
        since: TimeMs,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<EventPage, DataSourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.take_failure(wallet) {
            return Err(err);
        }

        let offset = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| DataSourceError::ParseError(format!("bad cursor {}", c)))?,
            None => 0,
        };

        let matching: Vec<&RawEvent> = self
            .events
            .get(wallet)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| {
                        e.timestamp
                            .map(|ts| TimeMs::from_secs(ts) >= since)
                            // Events without a timestamp are still delivered; the
                            // adapter rejects them.
                            .unwrap_or(true)
                    })
                    .collect()
            })
            .unwrap_or_default();

        let limit = limit.max(1);
        let end = (offset + limit).min(matching.len());
        let mut events = Vec::with_capacity((end.saturating_sub(offset)) * 2);
        for event in matching.iter().take(end).skip(offset) {
            events.push((*event).clone());
            if self.duplicate_delivery {
                events.push((*event).clone());
            }
        }

        let next_cursor = (end < matching.len()).then(|| end.to_string());
        Ok(EventPage {
            events,
            next_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, ts: i64) -> RawEvent {
        RawEvent {
            id: Some(id.to_string()),
            kind: Some("trade".to_string()),
            timestamp: Some(ts),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_mock_paginates() {
        let wallet = Address::new("0x1");
        let mock = MockEventSource::new().with_events(
            &wallet,
            vec![event("a", 1), event("b", 2), event("c", 3)],
        );

        let page1 = mock
            .fetch_events(&wallet, TimeMs::new(0), None, 2)
            .await
            .unwrap();
        assert_eq!(page1.events.len(), 2);
        assert_eq!(page1.next_cursor.as_deref(), Some("2"));

        let page2 = mock
            .fetch_events(&wallet, TimeMs::new(0), page1.next_cursor.as_deref(), 2)
            .await
            .unwrap();
        assert_eq!(page2.events.len(), 1);
        assert!(page2.next_cursor.is_none());
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_filters_by_watermark() {
        let wallet = Address::new("0x1");
        let mock = MockEventSource::new().with_events(&wallet, vec![event("a", 1), event("b", 5)]);
        let page = mock
            .fetch_events(&wallet, TimeMs::from_secs(5), None, 10)
            .await
            .unwrap();
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_mock_injected_failures_run_out() {
        let wallet = Address::new("0x1");
        let mock = MockEventSource::new()
            .with_event(&wallet, event("a", 1))
            .with_failures(&wallet, 1, DataSourceError::RateLimited);

        let first = mock.fetch_events(&wallet, TimeMs::new(0), None, 10).await;
        assert_eq!(first.unwrap_err(), DataSourceError::RateLimited);
        let second = mock.fetch_events(&wallet, TimeMs::new(0), None, 10).await;
        assert_eq!(second.unwrap().events.len(), 1);
    }

    #[tokio::test]
    async fn test_mock_duplicate_delivery() {
        let wallet = Address::new("0x1");
        let mock = MockEventSource::new()
            .with_event(&wallet, event("a", 1))
            .with_duplicate_delivery();
        let page = mock
            .fetch_events(&wallet, TimeMs::new(0), None, 10)
            .await
            .unwrap();
        assert_eq!(page.events.len(), 2);
    }
}
