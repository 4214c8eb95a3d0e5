use crate::{FeatureId, Pair, TrackId, ViewId};
use log::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Putative feature correspondences for every matched pair of views.
///
/// Matches are stored with the feature of `Pair::first` first, whatever order they were inserted in.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct PairwiseMatches {
    matches: BTreeMap<Pair, Vec<(FeatureId, FeatureId)>>,
}

impl PairwiseMatches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds matches between features of `view_a` and `view_b`.
    pub fn insert(
        &mut self,
        view_a: ViewId,
        view_b: ViewId,
        matches: impl IntoIterator<Item = (FeatureId, FeatureId)>,
    ) {
        if view_a == view_b {
            warn!("ignoring matches of view {} with itself", view_a);
            return;
        }
        let pair = Pair::new(view_a, view_b);
        let swap = pair.first() != view_a;
        self.matches
            .entry(pair)
            .or_default()
            .extend(matches.into_iter().map(|(a, b)| if swap { (b, a) } else { (a, b) }));
    }

    pub fn get(&self, pair: Pair) -> &[(FeatureId, FeatureId)] {
        self.matches.get(&pair).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (Pair, &[(FeatureId, FeatureId)])> + '_ {
        self.matches
            .iter()
            .map(|(&pair, matches)| (pair, matches.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

/// A feature seen in several views, with at most one feature per view.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Track {
    pub observations: BTreeMap<ViewId, FeatureId>,
}

impl Track {
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

/// All tracks and the inverse index from views to the tracks they observe.
///
/// Built once before reconstruction and only read afterwards.
#[derive(Clone, Debug, Default)]
pub struct TrackIndex {
    tracks: BTreeMap<TrackId, Track>,
    tracks_per_view: BTreeMap<ViewId, Vec<TrackId>>,
}

impl TrackIndex {
    /// Fuses pairwise matches transitively into tracks.
    ///
    /// A connected component that contains two different features of the same view is dropped entirely,
    /// as is any component shorter than `min_length`. Track ids are assigned in the order of each
    /// component's smallest `(view, feature)`.
    pub fn build(matches: &PairwiseMatches, min_length: usize) -> Self {
        let mut forest = UnionFind::default();
        for (pair, pair_matches) in matches.iter() {
            for &(feature_a, feature_b) in pair_matches {
                let a = forest.node((pair.first(), feature_a));
                let b = forest.node((pair.second(), feature_b));
                forest.union(a, b);
            }
        }

        let mut components: BTreeMap<usize, BTreeSet<(ViewId, FeatureId)>> = BTreeMap::new();
        for node in 0..forest.len() {
            let root = forest.find(node);
            components
                .entry(root)
                .or_default()
                .insert(forest.members[node]);
        }

        let mut conflicting = 0;
        let mut short = 0;
        let mut kept: Vec<BTreeMap<ViewId, FeatureId>> = vec![];
        for members in components.into_values() {
            let observations: BTreeMap<ViewId, FeatureId> = members.iter().copied().collect();
            if observations.len() != members.len() {
                conflicting += 1;
            } else if observations.len() < min_length {
                short += 1;
            } else {
                kept.push(observations);
            }
        }
        // Component roots depend on union order, so order by content for stable ids.
        kept.sort_by_key(|observations| {
            observations
                .iter()
                .next()
                .map(|(&view, &feature)| (view, feature))
        });

        let mut index = Self::default();
        for (id, observations) in kept.into_iter().enumerate() {
            for &view in observations.keys() {
                index.tracks_per_view.entry(view).or_default().push(id);
            }
            index.tracks.insert(id, Track { observations });
        }

        info!(
            "built {} tracks over {} views from {} matched pairs",
            index.tracks.len(),
            index.tracks_per_view.len(),
            matches.len()
        );
        debug!(
            "dropped {} tracks with conflicting features and {} shorter than {}",
            conflicting, short, min_length
        );
        index
    }

    pub fn track(&self, track: TrackId) -> Option<&Track> {
        self.tracks.get(&track)
    }

    pub fn tracks(&self) -> impl Iterator<Item = (TrackId, &Track)> + '_ {
        self.tracks.iter().map(|(&id, track)| (id, track))
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// The tracks observed by a view, in ascending order.
    pub fn tracks_of_view(&self, view: ViewId) -> &[TrackId] {
        self.tracks_per_view
            .get(&view)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Views that observe at least one track.
    pub fn views(&self) -> impl Iterator<Item = ViewId> + '_ {
        self.tracks_per_view.keys().copied()
    }

    /// Tracks observed by both views of the pair, in ascending order.
    pub fn shared_tracks(&self, pair: Pair) -> Vec<TrackId> {
        let b: BTreeSet<TrackId> = self
            .tracks_of_view(pair.second())
            .iter()
            .copied()
            .collect();
        self.tracks_of_view(pair.first())
            .iter()
            .copied()
            .filter(|track| b.contains(track))
            .collect()
    }

    /// The feature observing `track` in `view`, if any.
    pub fn feature(&self, track: TrackId, view: ViewId) -> Option<FeatureId> {
        self.tracks.get(&track)?.observations.get(&view).copied()
    }
}

#[derive(Default)]
struct UnionFind {
    ids: HashMap<(ViewId, FeatureId), usize>,
    members: Vec<(ViewId, FeatureId)>,
    parents: Vec<usize>,
    sizes: Vec<usize>,
}

impl UnionFind {
    fn len(&self) -> usize {
        self.parents.len()
    }

    fn node(&mut self, member: (ViewId, FeatureId)) -> usize {
        let next = self.parents.len();
        let id = *self.ids.entry(member).or_insert(next);
        if id == next {
            self.members.push(member);
            self.parents.push(id);
            self.sizes.push(1);
        }
        id
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parents[node] != node {
            // Path halving.
            self.parents[node] = self.parents[self.parents[node]];
            node = self.parents[node];
        }
        node
    }

    fn union(&mut self, a: usize, b: usize) {
        let (a, b) = (self.find(a), self.find(b));
        if a == b {
            return;
        }
        let (large, small) = if self.sizes[a] >= self.sizes[b] {
            (a, b)
        } else {
            (b, a)
        };
        self.parents[small] = large;
        self.sizes[large] += self.sizes[small];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn matches_chain_into_tracks() {
        let mut matches = PairwiseMatches::new();
        matches.insert(0, 1, vec![(0, 5), (1, 6)]);
        matches.insert(2, 1, vec![(9, 5)]);
        let index = TrackIndex::build(&matches, 2);

        assert_eq!(index.len(), 2);
        assert_eq!(
            index.track(0).unwrap().observations,
            btreemap! {0 => 0, 1 => 5, 2 => 9}
        );
        assert_eq!(
            index.track(1).unwrap().observations,
            btreemap! {0 => 1, 1 => 6}
        );
        assert_eq!(index.tracks_of_view(2), &[0]);
        assert_eq!(index.shared_tracks(Pair::new(1, 0)), vec![0, 1]);
        assert_eq!(index.feature(0, 2), Some(9));
    }

    #[test]
    fn conflicting_and_short_tracks_are_dropped() {
        let mut matches = PairwiseMatches::new();
        // Feature 0 and 1 of view 0 end up in the same component through view 1 and 2.
        matches.insert(0, 1, vec![(0, 0), (3, 3)]);
        matches.insert(1, 2, vec![(0, 0)]);
        matches.insert(2, 0, vec![(0, 1)]);
        let index = TrackIndex::build(&matches, 2);
        assert_eq!(index.len(), 1);
        assert_eq!(
            index.track(0).unwrap().observations,
            btreemap! {0 => 3, 1 => 3}
        );

        let index = TrackIndex::build(&matches, 3);
        assert!(index.is_empty());
        assert_eq!(index.views().count(), 0);
    }

    #[test]
    fn self_matches_are_ignored() {
        let mut matches = PairwiseMatches::new();
        matches.insert(4, 4, vec![(0, 1)]);
        assert!(matches.is_empty());
    }
}
