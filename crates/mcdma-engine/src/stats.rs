//! Per-queue statistics.

/// Cumulative counters for one queue.
///
/// These counters survive queue resets: a recovery cycle may only ever
/// increase them.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    /// Tail-pointer updates flushed to hardware.
    pub tail_updates: u64,
    /// Requests returned through completion polls.
    pub processed: u64,
    /// Cumulative dropped-transaction count reported by hardware.
    pub data_drops: u64,
    /// Drop-counter events (each may cover multiple drops).
    pub tid_errors: u32,
    /// Completion-timeout events.
    pub completion_timeouts: u32,
    /// Descriptor- or data-fetch errors.
    pub fetch_errors: u32,
    /// Reset-and-reconfigure cycles performed on this queue.
    pub resets: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_zeroed() {
        let stats = QueueStats::default();
        assert_eq!(stats.tail_updates, 0);
        assert_eq!(stats.processed, 0);
        assert_eq!(stats.data_drops, 0);
        assert_eq!(stats.resets, 0);
    }
}
