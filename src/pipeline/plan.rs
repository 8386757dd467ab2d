//! Batch planning: partition validated images into provider-sized requests.
//!
//! Two ceilings apply at once: an image count and an estimated request size
//! (`Σ byte_size × encoding_overhead`). A single greedy pass closes the
//! current batch whenever the next image would break either ceiling. Images
//! are never split or reordered, so concatenating the batches always gives
//! back the input sequence.
//!
//! Resource-constrained providers (small local models) get one image per
//! batch instead, trading throughput for a context window that is never
//! overrun.

use crate::config::BatchLimits;
use crate::pipeline::input::ImageDescriptor;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// An ordered, non-empty run of images sent in one provider request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// 0-indexed position among the job's batches; the merge key.
    pub index: usize,
    pub images: Vec<ImageDescriptor>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Inclusive 1-indexed page range covered by this batch.
    pub fn page_range(&self) -> (usize, usize) {
        let first = self.images.first().map_or(0, ImageDescriptor::page_number);
        let last = self.images.last().map_or(0, ImageDescriptor::page_number);
        (first, last)
    }

    /// Raw bytes on disk for all images.
    pub fn total_bytes(&self) -> u64 {
        self.images.iter().map(|i| i.byte_size).sum()
    }
}

/// Estimated request bytes for an image of `byte_size` bytes.
pub fn estimated_size(byte_size: u64, limits: &BatchLimits) -> f64 {
    byte_size as f64 * limits.encoding_overhead
}

/// Greedy dual-ceiling planner.
///
/// An image whose own estimate exceeds `max_batch_bytes` ends up alone in
/// its batch.
pub fn plan_batches(images: &[ImageDescriptor], limits: &BatchLimits) -> Vec<Batch> {
    let max_items = limits.max_images_per_batch.max(1);
    let max_bytes = limits.max_batch_bytes as f64;

    let mut batches: Vec<Batch> = Vec::new();
    let mut current: Vec<ImageDescriptor> = Vec::new();
    let mut current_size = 0.0_f64;

    for image in images {
        let size = estimated_size(image.byte_size, limits);
        let over_count = current.len() + 1 > max_items;
        let over_bytes = current_size + size > max_bytes;

        if !current.is_empty() && (over_count || over_bytes) {
            batches.push(Batch {
                index: batches.len(),
                images: std::mem::take(&mut current),
            });
            current_size = 0.0;
        }

        if size > max_bytes {
            debug!(
                "Image {} (~{:.0} bytes encoded) exceeds the batch ceiling; sending alone",
                image.filename, size
            );
        }

        current_size += size;
        current.push(image.clone());
    }

    if !current.is_empty() {
        batches.push(Batch {
            index: batches.len(),
            images: current,
        });
    }

    debug!(
        "Planned {} batch(es) for {} image(s): {:?}",
        batches.len(),
        images.len(),
        batches.iter().map(Batch::len).collect::<Vec<_>>()
    );
    batches
}

/// One image per batch.
pub fn plan_single_image_batches(images: &[ImageDescriptor]) -> Vec<Batch> {
    images
        .iter()
        .enumerate()
        .map(|(index, image)| Batch {
            index,
            images: vec![image.clone()],
        })
        .collect()
}

/// Pick the policy matching the provider's declared capability.
pub fn plan_for(
    resource_constrained: bool,
    images: &[ImageDescriptor],
    limits: &BatchLimits,
) -> Vec<Batch> {
    if resource_constrained {
        plan_single_image_batches(images)
    } else {
        plan_batches(images, limits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn images(sizes: &[u64]) -> Vec<ImageDescriptor> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &byte_size)| ImageDescriptor {
                path: PathBuf::from(format!("/scans/{i}.png")),
                filename: format!("{i}.png"),
                byte_size,
                page_index: i,
            })
            .collect()
    }

    fn limits(items: usize, bytes: u64) -> BatchLimits {
        BatchLimits {
            max_images_per_batch: items,
            max_batch_bytes: bytes,
            encoding_overhead: 1.4,
        }
    }

    fn sizes(batches: &[Batch]) -> Vec<usize> {
        batches.iter().map(Batch::len).collect()
    }

    fn assert_partition(input: &[ImageDescriptor], batches: &[Batch]) {
        let flat: Vec<_> = batches.iter().flat_map(|b| b.images.iter().cloned()).collect();
        assert_eq!(flat, input);
        for (i, b) in batches.iter().enumerate() {
            assert_eq!(b.index, i);
            assert!(!b.is_empty());
        }
    }

    #[test]
    fn count_ceiling_45_images() {
        let input = images(&[1000; 45]);
        let batches = plan_batches(&input, &limits(20, 14 * 1024 * 1024));
        assert_eq!(sizes(&batches), vec![20, 20, 5]);
        assert_partition(&input, &batches);
        assert_eq!(batches[2].page_range(), (41, 45));
    }

    #[test]
    fn payload_ceiling_closes_batches() {
        // 100 bytes × 1.4 = 140 per image; 3 fit under 450, the 4th does not.
        let input = images(&[100; 10]);
        let batches = plan_batches(&input, &limits(20, 450));
        assert_eq!(sizes(&batches), vec![3, 3, 3, 1]);
        assert_partition(&input, &batches);
    }

    #[test]
    fn oversized_image_goes_alone() {
        let input = images(&[10, 10, 5000, 10, 10]);
        let batches = plan_batches(&input, &limits(20, 1000));
        assert_eq!(sizes(&batches), vec![2, 1, 2]);
        assert_eq!(batches[1].images[0].byte_size, 5000);
        assert_partition(&input, &batches);
    }

    #[test]
    fn consecutive_oversized_images_are_separate() {
        let input = images(&[5000, 5000]);
        let batches = plan_batches(&input, &limits(20, 1000));
        assert_eq!(sizes(&batches), vec![1, 1]);
    }

    #[test]
    fn empty_input_yields_no_batches() {
        assert!(plan_batches(&[], &BatchLimits::default()).is_empty());
    }

    #[test]
    fn partition_holds_across_ceilings() {
        let input = images(&[7, 300, 20, 999, 1, 1, 450, 60, 2, 800, 33, 5, 5, 5]);
        for items in 1..6 {
            for bytes in [1u64, 50, 500, 1200, 10_000] {
                let batches = plan_batches(&input, &limits(items, bytes));
                assert_partition(&input, &batches);
                assert!(batches.iter().all(|b| b.len() <= items));
            }
        }
    }

    #[test]
    fn local_policy_is_one_per_batch() {
        let input = images(&[10, 20, 30]);
        let batches = plan_for(true, &input, &BatchLimits::default());
        assert_eq!(sizes(&batches), vec![1, 1, 1]);
        assert_partition(&input, &batches);

        let batches = plan_for(false, &input, &BatchLimits::default());
        assert_eq!(sizes(&batches), vec![3]);
    }
}
