//! View model of a partition for the browser widget

use serde::{Deserialize, Serialize};

use crate::partition::Partition;

/// One vessel as drawn in the widget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub index: usize,
    pub offset: u32,
    pub percentage: u32,
    pub owner: Option<String>,
    pub users: Vec<String>,
    pub removable: bool,
}

/// A fixed split position offered to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitMarker {
    pub offset: u32,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionView {
    pub segments: Vec<Segment>,
    pub markers: Vec<SplitMarker>,
    pub reserved: u32,
    pub submittable: bool,
}

impl PartitionView {
    pub fn render(partition: &Partition) -> Self {
        let limits = partition.limits();

        let mut offset = 0;
        let segments = partition
            .vessels()
            .iter()
            .enumerate()
            .map(|(index, vessel)| {
                let segment = Segment {
                    index,
                    offset,
                    percentage: vessel.percentage,
                    owner: vessel.owner.clone(),
                    users: vessel.users.clone(),
                    removable: index > 0,
                };
                offset += vessel.percentage;
                segment
            })
            .collect();

        let boundaries = partition.boundaries();
        let full = partition.is_full();
        let max = limits.max_vessels as u32;
        let markers = (1..max)
            .map(|i| {
                let offset = limits.total * i / max;
                SplitMarker {
                    offset,
                    active: !full && !boundaries.contains(&offset),
                }
            })
            .collect();

        Self {
            segments,
            markers,
            reserved: limits.reserved(),
            submittable: partition.is_submittable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{PartitionLimits, Role, Vessel};

    #[test]
    fn test_default_view() {
        let view = PartitionView::render(&Partition::new(PartitionLimits::default()));
        assert_eq!(view.segments.len(), 1);
        assert_eq!(view.segments[0].percentage, 80);
        assert!(!view.segments[0].removable);
        assert_eq!(view.reserved, 20);
        assert!(view.submittable);

        let offsets: Vec<u32> = view.markers.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![10, 20, 30, 40, 50, 60, 70]);
        assert!(view.markers.iter().all(|m| m.active));
    }

    #[test]
    fn test_markers_on_boundaries_are_inactive() {
        let mut partition = Partition::new(PartitionLimits::default());
        partition.split(30).unwrap();
        partition.assign(1, Role::Member, "bill").unwrap();

        let view = PartitionView::render(&partition);
        assert_eq!(view.segments[1].offset, 30);
        assert!(view.segments[1].removable);
        assert!(!view.submittable);

        let inactive: Vec<u32> = view
            .markers
            .iter()
            .filter(|m| !m.active)
            .map(|m| m.offset)
            .collect();
        assert_eq!(inactive, vec![30]);
    }

    #[test]
    fn test_full_partition_disables_markers() {
        let limits = PartitionLimits::from_reserved(20, 2);
        let partition = Partition::from_vessels(
            vec![Vessel::new(40).with_owner("alex"), Vessel::new(40)],
            limits,
        )
        .unwrap();

        let view = PartitionView::render(&partition);
        assert_eq!(view.markers.len(), 1);
        assert!(!view.markers[0].active);
    }
}
