use msync_core::types::Batch;

/// Splits a full batch into consecutive chunks of at most `batch_size`
/// metrics, preserving order. The chunks' metric lists concatenate back
/// to the input exactly once.
pub fn plan(batch: &Batch, batch_size: usize) -> Vec<Batch> {
    split(batch, batch_size.max(1))
}

/// Splits a fetched batch into pieces sized for the heal pool: chunk
/// size is `ceil(len / worker_count)`, so the pool is kept busy without
/// excessive per-task overhead. Pieces are disjoint by construction,
/// which is what guarantees at most one writer per target file.
pub fn rechunk(batch: &Batch, worker_count: usize) -> Vec<Batch> {
    let len = batch.metrics.len();
    if len == 0 {
        return Vec::new();
    }
    let chunk = len.div_ceil(worker_count.max(1));
    split(batch, chunk)
}

fn split(batch: &Batch, chunk_size: usize) -> Vec<Batch> {
    batch
        .metrics
        .chunks(chunk_size)
        .map(|metrics| Batch {
            metrics: metrics.to_vec(),
            ..batch.clone()
        })
        .collect()
}
