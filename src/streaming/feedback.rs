//! GPU visibility feedback parsing
//!
//! The culling pass appends page requests to a GPU buffer the CPU
//! reads back one or more frames later: `[count, (resource, page_start,
//! page_num, priority) * count]`. The readback is stale by design, so
//! requests naming removed geometry or out-of-range pages are dropped
//! rather than treated as errors.

use std::collections::HashMap;

use crate::streaming::slots::PageKey;

/// Hard cap on decoded requests per readback
pub const MAX_STREAMING_REQUESTS: u32 = 256 * 1024;

const REQUEST_STRIDE: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    pub key: PageKey,
    pub priority: u32,
}

/// Decode a raw feedback buffer against the current resource table.
/// `page_counts[resource]` is that geometry's page count. Ranges are
/// expanded per page, duplicates keep their highest priority, and the
/// result is sorted priority-descending (key-ascending on ties).
pub fn parse_feedback(raw: &[u32], page_counts: &[u32]) -> Vec<PageRequest> {
    if raw.is_empty() {
        return Vec::new();
    }

    let available = ((raw.len() - 1) / REQUEST_STRIDE) as u32;
    let count = raw[0].min(available).min(MAX_STREAMING_REQUESTS);

    let mut best: HashMap<PageKey, u32> = HashMap::new();
    for i in 0..count as usize {
        let record = &raw[1 + i * REQUEST_STRIDE..1 + (i + 1) * REQUEST_STRIDE];
        let (resource, page_start, page_num, priority) =
            (record[0], record[1], record[2], record[3]);

        let Some(&total_pages) = page_counts.get(resource as usize) else {
            continue;
        };
        if page_start >= total_pages || page_num == 0 {
            continue;
        }
        let page_end = page_start.saturating_add(page_num).min(total_pages);

        for page in page_start..page_end {
            let key = PageKey { resource, page };
            let entry = best.entry(key).or_insert(0);
            *entry = (*entry).max(priority);
        }
    }

    let mut requests: Vec<PageRequest> = best
        .into_iter()
        .map(|(key, priority)| PageRequest { key, priority })
        .collect();
    requests.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.key.cmp(&b.key)));
    requests
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_and_zero_count() {
        assert!(parse_feedback(&[], &[4]).is_empty());
        assert!(parse_feedback(&[0], &[4]).is_empty());
    }

    #[test]
    fn test_count_clamped_to_buffer() {
        // Claims 10 requests but carries one record
        let raw = [10, 0, 1, 1, 5];
        let requests = parse_feedback(&raw, &[4]);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].key, PageKey { resource: 0, page: 1 });
    }

    #[test]
    fn test_range_expansion_and_clamp() {
        // Range 2..=5 clipped to the 4-page resource
        let raw = [1, 0, 2, 4, 9];
        let requests = parse_feedback(&raw, &[4]);
        let pages: Vec<u32> = requests.iter().map(|r| r.key.page).collect();
        assert_eq!(pages, vec![2, 3]);
    }

    #[test]
    fn test_invalid_resource_dropped() {
        let raw = [2, 7, 0, 1, 5, 0, 0, 1, 3];
        let requests = parse_feedback(&raw, &[2]);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].key.resource, 0);
    }

    #[test]
    fn test_dedup_keeps_highest_priority() {
        let raw = [2, 0, 1, 1, 3, 0, 1, 1, 8];
        let requests = parse_feedback(&raw, &[4]);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].priority, 8);
    }

    #[test]
    fn test_sorted_priority_descending() {
        let raw = [3, 0, 0, 1, 1, 0, 1, 1, 9, 0, 2, 1, 5];
        let requests = parse_feedback(&raw, &[4]);
        let priorities: Vec<u32> = requests.iter().map(|r| r.priority).collect();
        assert_eq!(priorities, vec![9, 5, 1]);
    }
}
