// 进度显示
use crate::transfer::download::ByteSink;
use crate::transfer::upload::ByteSource;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}";

#[derive(Clone)]
pub struct ProgressTracker {
    progress_bar: ProgressBar,
    transferred_bytes: Arc<AtomicU64>,
    start_time: Arc<Instant>,
    last_update_time: Arc<Mutex<Instant>>,
    last_bytes: Arc<AtomicU64>,
}

impl ProgressTracker {
    pub fn new(total_size: u64, description: &str) -> Self {
        Self::with_bar(ProgressBar::new(total_size), description)
    }

    /// Tracker that counts bytes without drawing anything.
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::hidden(), "")
    }

    fn with_bar(progress_bar: ProgressBar, description: &str) -> Self {
        if let Ok(style) = ProgressStyle::default_bar().template(BAR_TEMPLATE) {
            progress_bar.set_style(style.progress_chars("#>-"));
        }
        progress_bar.set_message(description.to_string());

        Self {
            progress_bar,
            transferred_bytes: Arc::new(AtomicU64::new(0)),
            start_time: Arc::new(Instant::now()),
            last_update_time: Arc::new(Mutex::new(Instant::now())),
            last_bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn transferred(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    pub fn add_bytes(&self, bytes: u64) {
        let current = self.transferred_bytes.fetch_add(bytes, Ordering::Relaxed);
        let new_total = current + bytes;
        self.progress_bar.set_position(new_total);

        self.update_speed(new_total);
    }

    pub fn finish(&self) {
        let elapsed = self.start_time.elapsed();
        let total = self.transferred();

        let avg_speed = if elapsed.as_secs() > 0 {
            total / elapsed.as_secs()
        } else {
            total
        };

        self.progress_bar.finish_with_message(format!(
            "Transfer completed (avg speed: {})",
            format_speed(avg_speed)
        ));
    }

    pub fn finish_with_error(&self, error: &str) {
        self.progress_bar
            .abandon_with_message(format!("Transfer failed: {}", error));
    }

    // 每200ms更新一次速度，避免太频繁刷新
    fn update_speed(&self, current_bytes: u64) {
        let now = Instant::now();
        let mut last_time = self
            .last_update_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let elapsed = now.duration_since(*last_time);

        if elapsed >= Duration::from_millis(200) {
            let last_bytes = self.last_bytes.load(Ordering::Relaxed);
            let bytes_diff = current_bytes.saturating_sub(last_bytes);

            let speed = if elapsed.as_secs_f64() > 0.0 {
                (bytes_diff as f64 / elapsed.as_secs_f64()) as u64
            } else {
                0
            };

            self.progress_bar.set_message(format_speed(speed));

            *last_time = now;
            self.last_bytes.store(current_bytes, Ordering::Relaxed);
        }
    }
}

pub struct ProgressReader<R> {
    inner: R,
    tracker: ProgressTracker,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, tracker: ProgressTracker) -> Self {
        Self { inner, tracker }
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.tracker.add_bytes(n as u64);
        Ok(n)
    }
}

pub struct ProgressWriter<W> {
    inner: W,
    tracker: ProgressTracker,
}

impl<W> ProgressWriter<W> {
    pub fn new(inner: W, tracker: ProgressTracker) -> Self {
        Self { inner, tracker }
    }
}

impl<W: Write> Write for ProgressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.tracker.add_bytes(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Upload source whose reads advance a progress bar.
pub struct TrackedSource<S> {
    inner: S,
    tracker: ProgressTracker,
}

impl<S> TrackedSource<S> {
    pub fn new(inner: S, tracker: ProgressTracker) -> Self {
        Self { inner, tracker }
    }
}

impl<S: ByteSource> ByteSource for TrackedSource<S> {
    fn display_name(&self) -> Option<String> {
        self.inner.display_name()
    }

    fn open(&mut self) -> io::Result<Box<dyn Read + Send>> {
        let reader = self.inner.open()?;
        Ok(Box::new(ProgressReader::new(reader, self.tracker.clone())))
    }

    fn size_hint(&self) -> Option<u64> {
        self.inner.size_hint()
    }
}

/// Download sink whose writes advance a progress bar.
pub struct TrackedSink<K> {
    inner: K,
    tracker: ProgressTracker,
}

impl<K> TrackedSink<K> {
    pub fn new(inner: K, tracker: ProgressTracker) -> Self {
        Self { inner, tracker }
    }
}

impl<K: ByteSink> ByteSink for TrackedSink<K> {
    fn create(&mut self, display_name: &str) -> io::Result<Box<dyn Write + Send>> {
        let writer = self.inner.create(display_name)?;
        Ok(Box::new(ProgressWriter::new(writer, self.tracker.clone())))
    }
}

pub fn format_speed(bytes_per_sec: u64) -> String {
    if bytes_per_sec < 1024 {
        format!("{} B/s", bytes_per_sec)
    } else if bytes_per_sec < 1024 * 1024 {
        format!("{:.2} KB/s", bytes_per_sec as f64 / 1024.0)
    } else if bytes_per_sec < 1024 * 1024 * 1024 {
        format!("{:.2} MB/s", bytes_per_sec as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB/s", bytes_per_sec as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
