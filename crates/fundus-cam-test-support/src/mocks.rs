//! Mock implementations of core port traits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use candle_core::{Device, Result as TensorResult, Tensor};
use fundus_cam_core::domain::{AnalysisRecord, AuditEntry, ReportEntry, SourceImage};
use fundus_cam_core::ports::{
    AuditSink, Classifier, ImageSource, ProgressEvent, ProgressSink, RecordSink, ReportOutput,
};

/// Activation channels of [`MockClassifier`].
const MOCK_CHANNELS: usize = 4;
/// Pooling window that turns a 224x224 input into a 7x7 activation.
const MOCK_POOL: usize = 32;

/// A tiny fixed-weight network standing in for the production classifier.
///
/// `forward_to_target` mixes the three input channels into four feature
/// channels, applies ReLU and average-pools 32x32 windows (224 -> 7).
/// `forward_from_target` averages each channel spatially and applies a fixed
/// 4x2 linear layer. The result depends on image content, so attribution maps
/// are not uniform for structured inputs.
pub struct MockClassifier {
    mix: Tensor,
    head: Tensor,
    device: Device,
    detach_activation: bool,
    calls: Arc<AtomicUsize>,
}

impl MockClassifier {
    /// Creates the mock on the CPU.
    ///
    /// # Panics
    ///
    /// Panics if the fixed weight tensors cannot be created.
    #[must_use]
    #[allow(clippy::panic)]
    pub fn new() -> Self {
        let device = Device::Cpu;
        let mix = Tensor::new(
            &[
                [1.0f32, 0.5, 0.2],
                [-0.5, 1.0, 0.3],
                [0.2, -0.4, 1.0],
                [0.7, 0.7, 0.7],
            ],
            &device,
        )
        .unwrap_or_else(|e| panic!("mock weights: {e}"));
        let head = Tensor::new(&[[0.9f32, -0.6], [-0.4, 0.8], [0.3, 0.1], [-0.2, 0.5]], &device)
            .unwrap_or_else(|e| panic!("mock weights: {e}"));
        Self {
            mix,
            head,
            device,
            detach_activation: false,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A variant that cuts the graph at the attribution layer, so no
    /// gradient ever reaches it.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            detach_activation: true,
            ..Self::new()
        }
    }

    /// Number of times the network was entered (`forward_to_target` calls).
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Shared handle to the call counter, usable after the mock is moved
    /// into a service.
    #[must_use]
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl Default for MockClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier for MockClassifier {
    fn device(&self) -> &Device {
        &self.device
    }

    fn target_layer(&self) -> String {
        "mock_features".into()
    }

    fn forward_to_target(&self, input: &Tensor) -> TensorResult<Tensor> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (b, c, h, w) = input.dims4()?;
        let flat = input.reshape((b, c, h * w))?;
        let mixed = self.mix.unsqueeze(0)?.broadcast_matmul(&flat)?;
        let features = mixed.reshape((b, MOCK_CHANNELS, h, w))?.relu()?;
        features.avg_pool2d(MOCK_POOL)
    }

    fn forward_from_target(&self, activation: &Tensor) -> TensorResult<Tensor> {
        let activation = if self.detach_activation {
            activation.detach()
        } else {
            activation.clone()
        };
        let pooled = activation.mean(3)?.mean(2)?;
        pooled.matmul(&self.head)
    }
}

/// Mock implementation of `ImageSource` for testing.
///
/// Yields pre-built images and tracks iteration for assertions.
pub struct MockImageSource {
    images: Vec<SourceImage>,
    iteration_count: Arc<Mutex<usize>>,
}

impl MockImageSource {
    /// Creates a new mock source with the given images.
    #[must_use]
    pub fn new(images: Vec<SourceImage>) -> Self {
        Self {
            images,
            iteration_count: Arc::new(Mutex::new(0)),
        }
    }

    /// Creates an empty mock source.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(vec![])
    }

    /// Returns the number of times the source has been iterated.
    #[must_use]
    pub fn iteration_count(&self) -> usize {
        *self
            .iteration_count
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl ImageSource for MockImageSource {
    fn images(&self) -> Box<dyn Iterator<Item = anyhow::Result<SourceImage>> + Send + '_> {
        *self
            .iteration_count
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += 1;
        Box::new(self.images.iter().cloned().map(Ok))
    }

    fn count_hint(&self) -> Option<usize> {
        Some(self.images.len())
    }
}

/// Mock implementation of `ReportOutput` for testing.
///
/// Captures entries for later assertions.
#[derive(Default)]
pub struct MockReportOutput {
    entries: Mutex<Vec<ReportEntry>>,
    flush_count: AtomicUsize,
}

impl MockReportOutput {
    /// Creates a new mock output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all captured entries.
    #[must_use]
    pub fn entries(&self) -> Vec<ReportEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the number of times `flush()` was called.
    #[must_use]
    pub fn flush_count(&self) -> usize {
        self.flush_count.load(Ordering::SeqCst)
    }
}

impl ReportOutput for MockReportOutput {
    fn write(&self, entry: &ReportEntry) -> anyhow::Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        Ok(())
    }

    fn flush(&self) -> anyhow::Result<()> {
        self.flush_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Mock implementation of `ProgressSink` for testing.
///
/// Captures events for later assertions.
#[derive(Default)]
pub struct MockProgressSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl MockProgressSink {
    /// Creates a new mock progress sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all captured events.
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the number of `Completed` events.
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Completed { .. }))
            .count()
    }

    /// Returns the number of `Skipped` events.
    #[must_use]
    pub fn skipped_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Skipped { .. }))
            .count()
    }

    /// Returns the final counts from the `Finished` event, if any.
    #[must_use]
    pub fn finished_counts(&self) -> Option<(usize, usize)> {
        self.events().iter().find_map(|e| match e {
            ProgressEvent::Finished { processed, skipped } => Some((*processed, *skipped)),
            _ => None,
        })
    }
}

impl ProgressSink for MockProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// In-memory `RecordSink`.
#[derive(Default)]
pub struct MockRecordSink {
    records: Mutex<Vec<AnalysisRecord>>,
}

impl MockRecordSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all appended records.
    #[must_use]
    pub fn records(&self) -> Vec<AnalysisRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl RecordSink for MockRecordSink {
    fn append(&self, record: &AnalysisRecord) -> anyhow::Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

/// In-memory `AuditSink`.
#[derive(Default)]
pub struct MockAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MockAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded entries.
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AuditSink for MockAuditSink {
    fn record(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        Ok(())
    }
}
