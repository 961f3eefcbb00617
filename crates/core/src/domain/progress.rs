// Progress updates decoded from the worker line protocol

/// One decoded stdout line. Percentages are already clamped by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressUpdate {
    /// Transfer line with percent and optional rate/ETA, percent in 1..=99
    Transfer {
        percent: u8,
        speed: Option<String>,
        eta: Option<String>,
    },
    /// Named step marker
    Step(String),
    /// Bare numeric marker, percent in 0..=100
    Percent(u8),
}
