use std::collections::HashSet;

use crate::commands::{ImageMetadata, PlayerInfo, WorldInfo};
use crate::config::GroupingConfig;

/// One file as seen by grouping and delivery; read once, never mutated
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub file_path: String,
    pub byte_size: u64,
    pub dimensions: Option<(u32, u32)>,
    pub metadata: Option<ImageMetadata>,
    pub timestamp: Option<i64>,
}

impl ImageRecord {
    pub fn world(&self) -> Option<&WorldInfo> {
        self.metadata.as_ref().and_then(|m| m.world.as_ref())
    }

    pub fn world_id(&self) -> Option<&str> {
        self.world()
            .map(|w| w.id.as_str())
            .filter(|id| !id.is_empty())
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.world()
            .map(|w| w.instance_id.as_str())
            .filter(|id| !id.is_empty())
    }

    pub fn players(&self) -> &[PlayerInfo] {
        self.metadata
            .as_ref()
            .map(|m| m.players.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupKey {
    pub world_id: Option<String>,
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageGroup {
    pub key: GroupKey,
    pub records: Vec<ImageRecord>,
    /// Earliest capture time in the group
    pub timestamp: Option<i64>,
    pub all_players: Vec<PlayerInfo>,
    pub all_worlds: Vec<WorldInfo>,
}

impl ImageGroup {
    pub fn from_records(records: Vec<ImageRecord>) -> Self {
        let key = records
            .first()
            .map(|r| GroupKey {
                world_id: r.world_id().map(str::to_string),
                instance_id: r.instance_id().map(str::to_string),
            })
            .unwrap_or(GroupKey {
                world_id: None,
                instance_id: None,
            });

        let mut group = Self {
            key,
            records,
            timestamp: None,
            all_players: Vec::new(),
            all_worlds: Vec::new(),
        };
        group.refresh_summary();
        group
    }

    fn push(&mut self, record: ImageRecord) {
        self.records.push(record);
        self.refresh_summary();
    }

    fn refresh_summary(&mut self) {
        self.timestamp = self.records.iter().filter_map(|r| r.timestamp).min();

        let mut seen_players = HashSet::new();
        let mut players: Vec<PlayerInfo> = self
            .records
            .iter()
            .flat_map(|r| r.players())
            .filter(|p| seen_players.insert(p.id.clone()))
            .cloned()
            .collect();
        players.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        self.all_players = players;

        let mut seen_worlds = HashSet::new();
        self.all_worlds = self
            .records
            .iter()
            .filter_map(|r| r.world())
            .filter(|w| seen_worlds.insert(w.id.clone()))
            .cloned()
            .collect();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.records.iter().map(|r| r.file_path.clone()).collect()
    }

    pub fn time_span(&self) -> Option<(i64, i64)> {
        let mut stamps = self.records.iter().filter_map(|r| r.timestamp);
        let first = stamps.next()?;
        Some(stamps.fold((first, first), |(lo, hi), ts| (lo.min(ts), hi.max(ts))))
    }

    pub fn world_id(&self) -> Option<&str> {
        self.key.world_id.as_deref()
    }
}

/// Cluster records into ordered groups.
///
/// Timestamped records are walked in chronological order with one open
/// group. Records without a timestamp are placed afterwards, in input order.
pub fn group_images(records: Vec<ImageRecord>, config: &GroupingConfig) -> Vec<ImageGroup> {
    let total = records.len();
    let (mut timed, untimed): (Vec<ImageRecord>, Vec<ImageRecord>) =
        records.into_iter().partition(|r| r.timestamp.is_some());
    // sort_by_key is stable, so equal timestamps keep their input order
    timed.sort_by_key(|r| r.timestamp);

    let groups = if !config.group_by_world && !config.group_by_time {
        timed
            .into_iter()
            .chain(untimed)
            .map(|record| ImageGroup::from_records(vec![record]))
            .collect()
    } else {
        let window = config.time_window_secs as i64;
        let mut groups: Vec<ImageGroup> = Vec::new();

        for record in timed {
            let extends_open = groups.last().is_some_and(|open| {
                let same_world = !config.group_by_world || open.world_id() == record.world_id();
                let in_window = !config.group_by_time
                    || match (open.timestamp, record.timestamp) {
                        (Some(earliest), Some(ts)) => ts - earliest <= window,
                        _ => false,
                    };
                same_world && in_window
            });

            match groups.last_mut() {
                Some(open) if extends_open => open.push(record),
                _ => groups.push(ImageGroup::from_records(vec![record])),
            }
        }

        for record in untimed {
            let target = if config.group_by_world {
                record.world_id().and_then(|world_id| {
                    groups
                        .iter()
                        .rposition(|g| g.world_id() == Some(world_id))
                })
            } else {
                None
            };

            match target {
                Some(index) => groups[index].push(record),
                None => groups.push(ImageGroup::from_records(vec![record])),
            }
        }

        groups
    };

    log::info!("Created {} groups from {} images", groups.len(), total);
    groups
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn record(path: &str, world: Option<&str>, ts: Option<i64>) -> ImageRecord {
        ImageRecord {
            file_path: path.to_string(),
            byte_size: 1000,
            dimensions: Some((10, 10)),
            metadata: world.map(|w| ImageMetadata {
                author: None,
                world: Some(WorldInfo {
                    name: format!("World {}", w),
                    id: w.to_string(),
                    instance_id: String::new(),
                }),
                players: Vec::new(),
                timestamp: None,
            }),
            timestamp: ts,
        }
    }

    fn paths(groups: &[ImageGroup]) -> Vec<Vec<String>> {
        groups.iter().map(|g| g.file_paths()).collect()
    }

    fn config(by_world: bool, by_time: bool, window: u64) -> GroupingConfig {
        GroupingConfig {
            group_by_world: by_world,
            group_by_time: by_time,
            time_window_secs: window,
        }
    }

    #[test]
    fn test_no_grouping_gives_one_group_per_record() {
        let records = vec![
            record("c", Some("w1"), Some(30)),
            record("a", Some("w1"), Some(10)),
            record("n", None, None),
            record("b", Some("w1"), Some(20)),
        ];
        let groups = group_images(records, &GroupingConfig::ungrouped());
        assert_eq!(groups.len(), 4);
        assert_eq!(paths(&groups), vec![vec!["a"], vec!["b"], vec!["c"], vec!["n"]]);
    }

    #[test]
    fn test_world_and_time_window() {
        let records = vec![
            record("a", Some("A"), Some(0)),
            record("b", Some("A"), Some(60)),
            record("c", Some("B"), Some(120)),
            record("d", Some("A"), Some(180)),
        ];
        let groups = group_images(records, &config(true, true, 300));
        assert_eq!(
            paths(&groups),
            vec![vec!["a", "b"], vec!["c"], vec!["d"]]
        );
    }

    #[test]
    fn test_window_measured_from_group_start() {
        let records = vec![
            record("a", Some("A"), Some(0)),
            record("b", Some("A"), Some(200)),
            record("c", Some("A"), Some(400)),
        ];
        let groups = group_images(records, &config(true, true, 300));
        assert_eq!(paths(&groups), vec![vec!["a", "b"], vec!["c"]]);
        for group in &groups {
            let (lo, hi) = group.time_span().unwrap();
            assert!(hi - lo <= 300);
        }
    }

    #[test]
    fn test_zero_window_groups_identical_timestamps_only() {
        let records = vec![
            record("a", None, Some(5)),
            record("b", None, Some(5)),
            record("c", None, Some(6)),
        ];
        let groups = group_images(records, &config(false, true, 0));
        assert_eq!(paths(&groups), vec![vec!["a", "b"], vec!["c"]]);
    }

    #[test]
    fn test_untimed_records_join_last_group_of_their_world() {
        let records = vec![
            record("x", Some("A"), None),
            record("a", Some("A"), Some(0)),
            record("b", Some("B"), Some(10)),
            record("y", Some("C"), None),
            record("z", None, None),
        ];
        let groups = group_images(records, &config(true, true, 300));
        assert_eq!(
            paths(&groups),
            vec![vec!["a", "x"], vec!["b"], vec!["y"], vec!["z"]]
        );
    }

    #[test]
    fn test_world_only_grouping_ignores_time() {
        let records = vec![
            record("a", Some("A"), Some(0)),
            record("b", Some("A"), Some(100_000)),
            record("c", Some("B"), Some(100_001)),
        ];
        let groups = group_images(records, &config(true, false, 0));
        assert_eq!(paths(&groups), vec![vec!["a", "b"], vec!["c"]]);
    }

    #[test]
    fn test_every_record_lands_in_exactly_one_group() {
        let records: Vec<ImageRecord> = (0..40)
            .map(|i| {
                let world = ["A", "B", "C"][i % 3];
                let ts = if i % 7 == 0 { None } else { Some((i as i64 * 37) % 500) };
                record(&format!("f{}", i), Some(world), ts)
            })
            .collect();

        let groups = group_images(records, &config(true, true, 120));
        let mut all: Vec<String> = groups.iter().flat_map(|g| g.file_paths()).collect();
        assert_eq!(all.len(), 40);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 40);
    }

    #[test]
    fn test_group_summary_merges_players_and_worlds() {
        let mut first = record("a", Some("A"), Some(0));
        let mut second = record("b", Some("A"), Some(5));
        let player = |name: &str, id: &str| PlayerInfo {
            display_name: name.to_string(),
            id: id.to_string(),
        };
        if let Some(meta) = first.metadata.as_mut() {
            meta.players = vec![player("Zed", "usr_z"), player("Amy", "usr_a")];
        }
        if let Some(meta) = second.metadata.as_mut() {
            meta.players = vec![player("Amy", "usr_a"), player("Bob", "usr_b")];
        }

        let group = ImageGroup::from_records(vec![first, second]);
        let names: Vec<_> = group.all_players.iter().map(|p| p.display_name.as_str()).collect();
        assert_eq!(names, vec!["Amy", "Bob", "Zed"]);
        assert_eq!(group.all_worlds.len(), 1);
        assert_eq!(group.timestamp, Some(0));
        assert_eq!(group.key.world_id.as_deref(), Some("A"));
    }
}
