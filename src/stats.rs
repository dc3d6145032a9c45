//! Per-stage counters, updated only by the owning thread and collected at
//! join time (or printed by `--bench`).

#[derive(Debug, Default, Clone, Copy)]
pub struct StageStats {
    pub chunks: u64,
    pub frames: u64,
    pub embeddings: u64,
    pub windows: u64,
    pub predictions: u64,
    pub errors: u64,
}

/// Stats of the three detector stages, in pipeline order.
#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineStats {
    pub capture: StageStats,
    pub features: StageStats,
    pub wake: StageStats,
}
