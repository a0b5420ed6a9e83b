//! Fetch job partitioning

/// One bounded sequence range within one folder; the unit of fetch concurrency
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmailJob {
    /// Folder to open
    pub folder: String,
    /// IMAP sequence set, `"1:*"` or `"start:end"`
    pub range: String,
    /// Messages in the folder when the run was planned
    pub total_in_folder: u32,
}

/// Split `[1, count]` into contiguous ranges of at most `chunk_size`.
///
/// A folder fitting in one chunk becomes a single open-ended `1:*` job.
/// Empty folders produce no job.
pub fn partition(folder: &str, count: u32, chunk_size: u32) -> Vec<EmailJob> {
    if count == 0 {
        return Vec::new();
    }

    let chunk_size = chunk_size.max(1);
    if count <= chunk_size {
        return vec![EmailJob {
            folder: folder.to_string(),
            range: "1:*".to_string(),
            total_in_folder: count,
        }];
    }

    let mut jobs = Vec::with_capacity(count.div_ceil(chunk_size) as usize);
    let mut start = 1u32;
    while start <= count {
        let end = start.saturating_add(chunk_size - 1).min(count);
        jobs.push(EmailJob {
            folder: folder.to_string(),
            range: format!("{start}:{end}"),
            total_in_folder: count,
        });
        start = end + 1;
    }
    jobs
}
