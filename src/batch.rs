//! Batches of entries grouped by stream, and their push encoding.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::entry::{Entry, LabelSet};

/// An entry opened a new stream in a batch that is already at its limit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("streams limit of {limit} exceeded, stream: {labels}")]
pub struct StreamLimitExceeded {
    pub limit: usize,
    pub labels: LabelSet,
}

/// Entries accumulated for a single push.
#[derive(Debug)]
pub struct Batch {
    streams: BTreeMap<LabelSet, Vec<(DateTime<Utc>, String)>>,
    bytes: usize,
    entries: usize,
    created: Instant,
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

impl Batch {
    pub fn new() -> Self {
        Self {
            streams: BTreeMap::new(),
            bytes: 0,
            entries: 0,
            created: Instant::now(),
        }
    }

    /// Add an entry to its stream.
    ///
    /// With `max_streams > 0`, an entry whose labels are not yet in the batch
    /// is refused once the batch holds `max_streams` streams.
    pub fn add(&mut self, entry: Entry, max_streams: usize) -> Result<(), StreamLimitExceeded> {
        let Entry {
            labels,
            timestamp,
            line,
        } = entry;
        let size = line.len();

        match self.streams.get_mut(&labels) {
            Some(values) => values.push((timestamp, line)),
            None => {
                if max_streams > 0 && self.streams.len() >= max_streams {
                    return Err(StreamLimitExceeded {
                        limit: max_streams,
                        labels,
                    });
                }
                self.streams.insert(labels, vec![(timestamp, line)]);
            }
        }

        self.bytes += size;
        self.entries += 1;
        Ok(())
    }

    /// Size of the batch in bytes if `entry` were added.
    pub fn size_bytes_after(&self, entry: &Entry) -> usize {
        self.bytes + entry.size()
    }

    pub fn size_bytes(&self) -> usize {
        self.bytes
    }

    /// Number of entries across all streams.
    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Time since the batch was created.
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Encode as a Loki JSON push request:
    /// `{"streams":[{"stream":{...},"values":[["<unix ns>","<line>"]]}]}`.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let streams = self
            .streams
            .iter()
            .map(|(labels, values)| PushStream {
                stream: labels,
                values: values
                    .iter()
                    .map(|(ts, line)| {
                        let nanos = ts.timestamp_nanos_opt().unwrap_or_default();
                        (nanos.to_string(), line.as_str())
                    })
                    .collect(),
            })
            .collect();

        serde_json::to_vec(&PushRequest { streams })
    }
}

#[derive(Serialize)]
struct PushRequest<'a> {
    streams: Vec<PushStream<'a>>,
}

#[derive(Serialize)]
struct PushStream<'a> {
    stream: &'a LabelSet,
    values: Vec<(String, &'a str)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(app: &str, line: &str) -> Entry {
        let labels: LabelSet = [("app", app)].into_iter().collect();
        Entry::new(labels, line)
    }

    #[test]
    fn test_groups_by_stream() {
        let mut batch = Batch::new();
        batch.add(entry("a", "one"), 0).unwrap();
        batch.add(entry("b", "two"), 0).unwrap();
        batch.add(entry("a", "three"), 0).unwrap();

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.stream_count(), 2);
        assert_eq!(batch.size_bytes(), 11);
        assert_eq!(batch.size_bytes_after(&entry("a", "four")), 15);
    }

    #[test]
    fn test_stream_limit_rejects_new_streams_only() {
        let mut batch = Batch::new();
        batch.add(entry("a", "one"), 1).unwrap();

        let err = batch.add(entry("b", "two"), 1).unwrap_err();
        assert_eq!(err.limit, 1);
        assert_eq!(err.labels.get("app"), Some("b"));

        // The existing stream keeps accepting lines.
        batch.add(entry("a", "three"), 1).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.stream_count(), 1);
    }

    #[test]
    fn test_encode_push_request() {
        let mut batch = Batch::new();
        let mut e = entry("svc", "hello \"world\"");
        e.timestamp = Utc.timestamp_opt(1_700_000_000, 5).unwrap();
        batch.add(e, 0).unwrap();

        let body = String::from_utf8(batch.encode().unwrap()).unwrap();
        assert_eq!(
            body,
            r#"{"streams":[{"stream":{"app":"svc"},"values":[["1700000000000000005","hello \"world\""]]}]}"#
        );
    }

    #[test]
    fn test_empty_batch() {
        let batch = Batch::default();
        assert!(batch.is_empty());
        assert_eq!(batch.encode().unwrap(), br#"{"streams":[]}"#.to_vec());
    }
}
