// Copyright 2025-Present Tracebeam authors
// SPDX-License-Identifier: Apache-2.0

/// One frame in the merged profile tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileNode {
    pub frame: String,
    pub sample_count: u64,
    pub children: Vec<ProfileNode>,
}

/// Aggregation of periodically sampled call stacks for one transaction.
///
/// Stacks are merged frame by frame, outermost first, so hot paths show up as
/// heavily counted branches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    sample_count: u64,
    roots: Vec<ProfileNode>,
}

impl Profile {
    pub fn new() -> Self {
        Profile::default()
    }

    /// Merges one sampled stack, frames ordered outermost first.
    pub fn add_stack(&mut self, frames: &[String]) {
        self.sample_count += 1;
        let mut nodes = &mut self.roots;
        for frame in frames {
            let position = nodes.iter().position(|n| n.frame == *frame);
            let index = match position {
                Some(index) => {
                    nodes[index].sample_count += 1;
                    index
                }
                None => {
                    nodes.push(ProfileNode {
                        frame: frame.clone(),
                        sample_count: 1,
                        children: Vec::new(),
                    });
                    nodes.len() - 1
                }
            };
            nodes = &mut nodes[index].children;
        }
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn roots(&self) -> &[ProfileNode] {
        &self.roots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn common_prefix_merges() {
        let mut profile = Profile::new();
        profile.add_stack(&frames(&["main", "handle", "query"]));
        profile.add_stack(&frames(&["main", "handle", "render"]));

        assert_eq!(profile.sample_count(), 2);
        assert_eq!(profile.roots().len(), 1);
        let main = &profile.roots()[0];
        assert_eq!(main.sample_count, 2);
        let handle = &main.children[0];
        assert_eq!(handle.sample_count, 2);
        assert_eq!(handle.children.len(), 2);
    }

    #[test]
    fn distinct_roots_stay_separate() {
        let mut profile = Profile::new();
        profile.add_stack(&frames(&["main"]));
        profile.add_stack(&frames(&["worker"]));
        assert_eq!(profile.roots().len(), 2);
    }

    #[test]
    fn empty_stack_still_counts() {
        let mut profile = Profile::new();
        profile.add_stack(&[]);
        assert_eq!(profile.sample_count(), 1);
        assert!(profile.roots().is_empty());
    }
}
