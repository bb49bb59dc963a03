use std::{fs, path::PathBuf};

/// Window within which a second reset counts as deliberate.
pub const DOUBLE_RESET_WINDOW_MS: u64 = 10_000;

/// A timestamp slot in memory that survives a warm reset but not a
/// full power loss. `None` means no marker, so a cold power-on can
/// never classify as a double reset.
pub trait ResetMarker {
    fn read(&mut self) -> Option<u64>;
    fn write(&mut self, stamp_ms: u64);
    fn clear(&mut self);
}

/// Classifies a boot as a deliberate double reset or a normal start.
pub struct DoubleResetDetector<M> {
    marker: M,
    window_ms: u64,
}

impl<M: ResetMarker> DoubleResetDetector<M> {
    pub fn new(marker: M) -> Self {
        Self::with_window(marker, DOUBLE_RESET_WINDOW_MS)
    }

    pub fn with_window(marker: M, window_ms: u64) -> Self {
        Self { marker, window_ms }
    }

    /// Inspects the marker left by the previous boot and arms a fresh
    /// one for the next. True means the caller should enter forced
    /// reconfiguration.
    pub fn detect(&mut self, now_ms: u64) -> bool {
        let previous = self.marker.read();
        self.marker.write(now_ms);
        previous
            .map(|stamp| now_ms.saturating_sub(stamp) < self.window_ms)
            .unwrap_or(false)
    }

    /// Clears the marker so a later accidental reset is not
    /// mis-classified. Safe to call any number of times.
    pub fn stop(&mut self) {
        self.marker.clear();
    }
}

/// Host stand-in for RTC memory: a file outlives a process restart the
/// way RTC memory outlives a warm reset. Failures are swallowed; a
/// missing marker just means "normal boot".
pub struct FileResetMarker {
    path: PathBuf,
}

impl FileResetMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ResetMarker for FileResetMarker {
    fn read(&mut self) -> Option<u64> {
        fs::read_to_string(&self.path).ok()?.trim().parse().ok()
    }

    fn write(&mut self, stamp_ms: u64) {
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let _ = fs::write(&self.path, stamp_ms.to_string());
    }

    fn clear(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// In-memory marker for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct SlotMarker(pub Option<u64>);

#[cfg(test)]
impl ResetMarker for SlotMarker {
    fn read(&mut self) -> Option<u64> {
        self.0
    }

    fn write(&mut self, stamp_ms: u64) {
        self.0 = Some(stamp_ms);
    }

    fn clear(&mut self) {
        self.0 = None;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn cold_boot_is_never_a_double_reset() {
        let mut detector = DoubleResetDetector::new(SlotMarker::default());
        assert!(!detector.detect(0));
    }

    #[test]
    fn reset_inside_window_is_a_double_reset() {
        let mut detector = DoubleResetDetector::new(SlotMarker(Some(0)));
        assert!(detector.detect(3_000));
    }

    #[test]
    fn reset_after_window_is_a_normal_boot() {
        let mut detector = DoubleResetDetector::new(SlotMarker(Some(0)));
        assert!(!detector.detect(15_000));
    }

    #[test]
    fn detect_arms_the_marker_for_the_next_boot() {
        let mut detector = DoubleResetDetector::new(SlotMarker::default());

        assert!(!detector.detect(100_000));
        assert_eq!(detector.marker.0, Some(100_000));
        assert!(detector.detect(103_000));
    }

    #[test]
    fn stop_is_idempotent_and_clears_classification() {
        let mut detector = DoubleResetDetector::new(SlotMarker(Some(0)));

        detector.stop();
        detector.stop();

        assert_eq!(detector.marker.0, None);
        assert!(!detector.detect(1_000));
    }

    #[test]
    fn file_marker_round_trips_and_clears() {
        let path = std::env::temp_dir()
            .join("relay-common-tests")
            .join(format!("marker-{}", std::process::id()));
        let mut marker = FileResetMarker::new(&path);

        marker.write(42_000);
        assert_eq!(marker.read(), Some(42_000));

        marker.clear();
        assert_eq!(marker.read(), None);
        marker.clear();
    }
}
