//! Byte-stream adapter that turns writes into labeled log entries.

use std::io;

use chrono::Utc;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::entry::{Entry, LabelSet};
use crate::shipper::Shipper;

/// Writes each buffer as one log entry onto a [`Shipper`]'s channel.
///
/// Every write stamps the current time, clones the static label set and
/// blocks while the channel is full, so a slow endpoint slows the producer
/// instead of growing memory. Bytes are passed through as text; invalid
/// UTF-8 is replaced rather than rejected.
///
/// Outside a runtime, and on multi-thread runtime workers (through
/// `block_in_place`), a full channel blocks the calling thread. On a
/// current-thread runtime nothing may block, so a full channel fails the
/// write with `io::ErrorKind::WouldBlock` instead.
///
/// # Data loss on close
///
/// [`LogWriter::close`] stops the shipper immediately. Entries still queued
/// or in a batch that has not been delivered yet are dropped. Hosts that need
/// everything delivered should stop the shipper gracefully first (see
/// [`LogWriter::into_shipper`]).
pub struct LogWriter<S: Shipper> {
    shipper: S,
    tx: mpsc::Sender<Entry>,
    labels: LabelSet,
    closed: bool,
}

impl<S: Shipper> LogWriter<S> {
    pub fn new(shipper: S, labels: LabelSet) -> Self {
        let tx = shipper.sender();
        Self {
            shipper,
            tx,
            labels,
            closed: false,
        }
    }

    /// The labels attached to every entry.
    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn shipper(&self) -> &S {
        &self.shipper
    }

    /// Stop the shipper without waiting for queued entries to be delivered.
    ///
    /// Never fails; calling it again is a no-op.
    pub fn close(&mut self) -> io::Result<()> {
        if !self.closed {
            self.closed = true;
            self.shipper.stop_now();
        }
        Ok(())
    }

    /// Give up the writer and take back the shipper, for example to call
    /// [`Shipper::stop`] and deliver everything that was written.
    pub fn into_shipper(self) -> S {
        self.shipper
    }
}

impl<S: Shipper> io::Write for LogWriter<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "writer is closed"));
        }

        let entry = Entry {
            labels: self.labels.clone(),
            timestamp: Utc::now(),
            line: String::from_utf8_lossy(buf).into_owned(),
        };

        match Handle::try_current() {
            Err(_) => self.tx.blocking_send(entry).map_err(|_| closed_channel())?,
            Ok(handle) => match handle.runtime_flavor() {
                RuntimeFlavor::CurrentThread => {
                    // Blocking here would stall the only thread driving the runtime.
                    self.tx.try_send(entry).map_err(|e| match e {
                        TrySendError::Full(_) => io::Error::new(
                            io::ErrorKind::WouldBlock,
                            "entries channel is full and the current-thread runtime cannot block",
                        ),
                        TrySendError::Closed(_) => closed_channel(),
                    })?
                }
                _ => tokio::task::block_in_place(|| self.tx.blocking_send(entry)).map_err(|_| closed_channel())?,
            },
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn closed_channel() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "shipper is no longer accepting entries")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct MockShipper {
        tx: mpsc::Sender<Entry>,
        stop_calls: Arc<AtomicUsize>,
        stop_now_calls: Arc<AtomicUsize>,
    }

    impl Shipper for MockShipper {
        fn sender(&self) -> mpsc::Sender<Entry> {
            self.tx.clone()
        }

        fn stop(&mut self) {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
        }

        fn stop_now(&mut self) {
            self.stop_now_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn mock(capacity: usize) -> (MockShipper, mpsc::Receiver<Entry>) {
        let (tx, rx) = mpsc::channel(capacity);
        let shipper = MockShipper {
            tx,
            stop_calls: Arc::new(AtomicUsize::new(0)),
            stop_now_calls: Arc::new(AtomicUsize::new(0)),
        };
        (shipper, rx)
    }

    fn labels() -> LabelSet {
        [("app", "svc"), ("zone", "eu")].into_iter().collect()
    }

    #[test]
    fn test_writes_become_ordered_entries() {
        let (shipper, mut rx) = mock(16);
        let mut writer = LogWriter::new(shipper, labels());

        assert_eq!(writer.write(b"hello\n").unwrap(), 6);
        assert_eq!(writer.write(b"world\n").unwrap(), 6);

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());

        assert_eq!(first.line, "hello\n");
        assert_eq!(second.line, "world\n");
        assert_eq!(first.labels, labels());
        assert_eq!(second.labels, labels());
        assert!(first.timestamp <= second.timestamp);
    }

    #[test]
    fn test_entry_labels_are_independent() {
        let (shipper, mut rx) = mock(16);
        let mut writer = LogWriter::new(shipper, labels());

        writer.write(b"one").unwrap();
        writer.write(b"two").unwrap();

        let mut first = rx.try_recv().unwrap();
        first.labels.insert("app", "changed");
        first.labels.remove("zone");

        let second = rx.try_recv().unwrap();
        assert_eq!(second.labels.get("app"), Some("svc"));
        assert_eq!(second.labels.get("zone"), Some("eu"));
        assert_eq!(writer.labels(), &labels());
    }

    #[test]
    fn test_invalid_utf8_is_passed_through() {
        let (shipper, mut rx) = mock(16);
        let mut writer = LogWriter::new(shipper, labels());

        assert_eq!(writer.write(b"ok \xff end").unwrap(), 8);
        assert_eq!(rx.try_recv().unwrap().line, "ok \u{fffd} end");
    }

    #[test]
    fn test_full_channel_blocks_writer() {
        let (shipper, mut rx) = mock(1);
        let mut writer = LogWriter::new(shipper, labels());
        writer.write(b"first").unwrap();

        let handle = std::thread::spawn(move || {
            writer.write(b"second").unwrap();
            writer
        });

        std::thread::sleep(Duration::from_millis(100));
        assert!(!handle.is_finished());

        assert_eq!(rx.blocking_recv().unwrap().line, "first");
        let _writer = handle.join().unwrap();
        assert_eq!(rx.blocking_recv().unwrap().line, "second");
    }

    #[test]
    fn test_close_stops_now_without_draining() {
        let (shipper, mut rx) = mock(16);
        let stop_calls = shipper.stop_calls.clone();
        let stop_now_calls = shipper.stop_now_calls.clone();
        let mut writer = LogWriter::new(shipper, labels());

        writer.write(b"queued").unwrap();
        writer.close().unwrap();
        writer.close().unwrap();

        assert_eq!(stop_now_calls.load(Ordering::SeqCst), 1);
        assert_eq!(stop_calls.load(Ordering::SeqCst), 0);
        // Nothing consumed the queued entry.
        assert_eq!(rx.try_recv().unwrap().line, "queued");
    }

    #[test]
    fn test_write_after_close_fails() {
        let (shipper, _rx) = mock(16);
        let mut writer = LogWriter::new(shipper, labels());
        writer.close().unwrap();

        let err = writer.write(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_closed_channel_is_broken_pipe() {
        let (shipper, rx) = mock(16);
        let mut writer = LogWriter::new(shipper, labels());
        drop(rx);

        let err = writer.write(b"nobody listening").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_from_multi_thread_runtime() {
        let (shipper, mut rx) = mock(16);
        let mut writer = LogWriter::new(shipper, labels());

        assert_eq!(writer.write(b"hello").unwrap(), 5);
        assert_eq!(rx.recv().await.unwrap().line, "hello");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_through_loki_writer_inside_runtime() {
        let mut module = crate::module::LokiLog::from_json(
            r#"{"url":"http://127.0.0.1:9/loki/api/v1/push","labels":{"app":"svc"}}"#,
        )
        .unwrap();
        crate::module::WriterModule::validate(&mut module).unwrap();

        let mut writer = module.open().unwrap();
        assert_eq!(writer.write(b"hello").unwrap(), 5);
        tokio::task::block_in_place(|| writer.close()).unwrap();
    }

    #[tokio::test]
    async fn test_current_thread_runtime_never_blocks() {
        let (shipper, mut rx) = mock(1);
        let mut writer = LogWriter::new(shipper, labels());

        assert_eq!(writer.write(b"first").unwrap(), 5);
        let err = writer.write(b"second").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        assert_eq!(rx.recv().await.unwrap().line, "first");
        assert_eq!(writer.write(b"third").unwrap(), 5);
    }
}
