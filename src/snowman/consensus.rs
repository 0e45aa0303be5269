use super::{bag::Bag, snowball::Snowball, types::Parameters};
use commonware_cryptography::Digest;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, trace};

/// Blocks decided by one round of vote application, in decision order.
///
/// Accepted ids are in chain order (parent before child); a rejected
/// block always appears after the accepted block that displaced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decisions<D: Digest> {
    pub accepted: Vec<D>,
    pub rejected: Vec<D>,
}

impl<D: Digest> Default for Decisions<D> {
    fn default() -> Self {
        Self {
            accepted: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

struct Node<D: Digest> {
    /// `None` once the block is the accepted head (the root of the live
    /// tree).
    parent: Option<D>,
    children: BTreeSet<D>,
    /// Confidence for the decision among `children`; populated with the
    /// first child.
    sb: Option<Snowball<D>>,
    /// Reset confidence at the next vote.
    should_falter: bool,
}

impl<D: Digest> Node<D> {
    fn root() -> Self {
        Self {
            parent: None,
            children: BTreeSet::new(),
            sb: None,
            should_falter: false,
        }
    }
}

/// Used to track the Kahn topological sort status of one node.
struct KahnNode<D: Digest> {
    /// Children still to be processed. A node with in-degree zero is a
    /// leaf of the reachable subgraph.
    in_degree: usize,
    /// Votes aggregated so far for the node's children.
    votes: Bag<D>,
}

impl<D: Digest> Default for KahnNode<D> {
    fn default() -> Self {
        Self {
            in_degree: 0,
            votes: Bag::new(),
        }
    }
}

/// One entry of the vote stack: votes to apply to the snowball at
/// `parent`.
struct VoteFrame<D: Digest> {
    parent: D,
    votes: Bag<D>,
}

/// A tree of candidate blocks rooted at the last accepted block,
/// amortizing network polls to vote on entire branches at once.
pub struct Topological<D: Digest> {
    params: Parameters,
    head: D,
    tail: D,
    blocks: HashMap<D, Node<D>>,
}

impl<D: Digest> Topological<D> {
    /// Seed the tree with the last accepted block.
    pub fn new(params: Parameters, root: D) -> Self {
        let mut blocks = HashMap::new();
        blocks.insert(root, Node::root());
        Self {
            params,
            head: root,
            tail: root,
            blocks,
        }
    }

    /// The last accepted block.
    pub fn head(&self) -> D {
        self.head
    }

    /// The current preferred tip: the deepest block reachable by
    /// following each node's preferred child from the head.
    pub fn preference(&self) -> D {
        self.tail
    }

    /// Whether `id` is in the live tree (including the head).
    pub fn contains(&self, id: &D) -> bool {
        self.blocks.contains_key(id)
    }

    /// True once only the accepted head remains.
    pub fn finalized(&self) -> bool {
        self.blocks.len() == 1
    }

    /// Number of undecided blocks in the live tree.
    pub fn len_processing(&self) -> usize {
        self.blocks.len() - 1
    }

    /// Attach a block under its (already present) parent.
    ///
    /// Returns `false` if the parent has been pruned from the tree, in
    /// which case the caller must reject the block: its ancestry lost.
    pub fn add(&mut self, id: D, parent: D) -> bool {
        let Some(parent_node) = self.blocks.get_mut(&parent) else {
            // The ancestor was pruned, so the dependent is transitively
            // rejected.
            debug!(?id, ?parent, "block added with pruned ancestry");
            return false;
        };

        parent_node.children.insert(id);
        match parent_node.sb.as_mut() {
            Some(sb) => sb.add_choice(id),
            None => {
                parent_node.sb = Some(Snowball::new(
                    self.params.beta_virtuous,
                    self.params.beta_rogue,
                    id,
                ));
            }
        }

        self.blocks.insert(
            id,
            Node {
                parent: Some(parent),
                children: BTreeSet::new(),
                sb: None,
                should_falter: false,
            },
        );

        // If we are extending the tail, this is the new tail.
        if self.tail == parent {
            self.tail = id;
        }
        trace!(?id, ?parent, "block added");
        true
    }

    /// Integrate one round of votes. May accept blocks (and transitively
    /// reject their rivals); the outcome lists every decision in order.
    pub fn record_poll(&mut self, votes: Bag<D>) -> Decisions<D> {
        let (mut kahns, leaves) = self.calculate_in_degree(votes);
        let stack = self.push_votes(&mut kahns, leaves);
        let (preferred, decisions) = self.vote(stack);
        self.tail = self.preferred_descendent(preferred);
        decisions
    }

    /// Set up the topological ordering: annotate the reachable section
    /// of the tree with in-degrees and non-transitively applied votes,
    /// and return the leaves.
    fn calculate_in_degree(&self, votes: Bag<D>) -> (HashMap<D, KahnNode<D>>, Vec<D>) {
        let mut kahns: HashMap<D, KahnNode<D>> = HashMap::new();
        let mut leaves: BTreeSet<D> = BTreeSet::new();

        for (vote, count) in votes.iter() {
            // A vote for something unknown or already decided is
            // dropped.
            let Some(node) = self.blocks.get(vote) else {
                continue;
            };
            let Some(parent) = node.parent else {
                continue;
            };

            let kahn = kahns.entry(parent).or_default();
            let previously_seen = kahn.votes.len() > 0 || kahn.in_degree > 0;
            kahn.votes.add_count(*vote, count);
            if previously_seen {
                continue;
            }

            // First time this parent is reached: walk toward the root,
            // bumping in-degrees until we hit an already-traversed
            // branch.
            leaves.insert(parent);
            let mut cursor = parent;
            while let Some(node) = self.blocks.get(&cursor) {
                let Some(grandparent) = node.parent else {
                    break;
                };
                let kahn = kahns.entry(grandparent).or_default();
                kahn.in_degree += 1;
                if kahn.in_degree == 1 {
                    // Transitively seen for the first time: no longer a
                    // leaf.
                    leaves.remove(&grandparent);
                } else {
                    break;
                }
                cursor = grandparent;
            }
        }

        (kahns, leaves.into_iter().collect())
    }

    /// Convert the annotated graph into a stack of votes to apply,
    /// leafward frames first.
    fn push_votes(
        &self,
        kahns: &mut HashMap<D, KahnNode<D>>,
        mut leaves: Vec<D>,
    ) -> Vec<VoteFrame<D>> {
        let mut stack = Vec::new();
        while let Some(leaf) = leaves.pop() {
            let Some(kahn) = kahns.remove(&leaf) else {
                continue;
            };
            let Some(node) = self.blocks.get(&leaf) else {
                continue;
            };

            let total = kahn.votes.len();
            if total >= self.params.alpha {
                stack.push(VoteFrame {
                    parent: leaf,
                    votes: kahn.votes,
                });
            }

            // Stop traversing once we pass into the decided frontier.
            let Some(parent) = node.parent else {
                continue;
            };
            if let Some(dep) = kahns.get_mut(&parent) {
                dep.in_degree -= 1;
                // The votes transfer upward as votes for this node.
                dep.votes.add_count(leaf, total);
                if dep.in_degree == 0 {
                    leaves.push(parent);
                }
            }
        }
        stack
    }

    /// Unwind the vote stack root-ward, applying polls and accepting
    /// finalized children of the head.
    fn vote(&mut self, mut stack: Vec<VoteFrame<D>>) -> (D, Decisions<D>) {
        let mut decisions = Decisions::default();

        if stack.is_empty() {
            // No branch gathered an alpha majority: every vote on the
            // head's subtree decays.
            let head = self.head;
            if let Some(node) = self.blocks.get_mut(&head) {
                node.should_falter = true;
            }
            debug!(
                processing = self.len_processing(),
                "no progress was made on this poll"
            );
            return (self.tail, decisions);
        }

        let mut on_tail = true;
        let mut tail = self.head;
        while let Some(frame) = stack.pop() {
            // The branch may have been pruned by an earlier acceptance.
            let Some(node) = self.blocks.get_mut(&frame.parent) else {
                break;
            };

            let trans_falter = node.should_falter;
            if node.should_falter {
                node.sb
                    .as_mut()
                    .expect("voted node must have children")
                    .record_unsuccessful_poll();
                node.should_falter = false;
                trace!(parent = ?frame.parent, "reset confidence");
            }
            let sb = node.sb.as_mut().expect("voted node must have children");
            sb.record_poll(&frame.votes, self.params.alpha);

            // Only accept when finalized and at the head.
            let sb_preference = sb.preference();
            let finalized = sb.finalized();
            let children: Vec<D> = node.children.iter().copied().collect();
            if finalized && self.head == frame.parent {
                self.accept(frame.parent, sb_preference, &mut decisions);
                tail = sb_preference;
            }

            // If this was the last frame with votes, the empty next id
            // resets all children below.
            let next = stack.last().map(|frame| frame.parent);

            on_tail = on_tail && next == Some(sb_preference);
            if on_tail {
                tail = sb_preference;
            }

            // Children off the voted path (or below a faltered branch)
            // reset at their next vote.
            for child in children {
                if trans_falter || Some(child) != next {
                    if let Some(child_node) = self.blocks.get_mut(&child) {
                        child_node.should_falter = true;
                    }
                }
            }
        }

        (tail, decisions)
    }

    /// Commit `preferred` as the new head: reject its siblings (and
    /// their descendants) and prune the old head.
    fn accept(&mut self, parent: D, preferred: D, decisions: &mut Decisions<D>) {
        let node = self.blocks.remove(&parent).expect("accepting missing node");

        debug!(?preferred, "accepting block");
        decisions.accepted.push(preferred);

        let mut rejected: Vec<D> = node
            .children
            .iter()
            .copied()
            .filter(|child| *child != preferred)
            .collect();
        while let Some(reject) = rejected.pop() {
            decisions.rejected.push(reject);
            let Some(node) = self.blocks.remove(&reject) else {
                continue;
            };
            rejected.extend(node.children);
        }

        self.head = preferred;
        self.blocks
            .get_mut(&preferred)
            .expect("accepted block must be in the tree")
            .parent = None;
    }

    /// Follow each node's preferred child from `id` to a leaf.
    fn preferred_descendent(&self, id: D) -> D {
        let mut cursor = id;
        while let Some(sb) = self.blocks.get(&cursor).and_then(|node| node.sb.as_ref()) {
            cursor = sb.preference();
        }
        cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_cryptography::sha256::{hash, Digest as Sha256Digest};

    const PARAMS: Parameters = Parameters {
        k: 5,
        alpha: 4,
        beta_virtuous: 3,
        beta_rogue: 3,
        concurrent_repolls: 1,
    };

    fn votes_for(id: Sha256Digest, count: usize) -> Bag<Sha256Digest> {
        let mut bag = Bag::new();
        bag.add_count(id, count);
        bag
    }

    #[test]
    fn test_initialize() {
        let genesis = hash(b"genesis");
        let tree = Topological::new(PARAMS, genesis);
        assert_eq!(tree.preference(), genesis);
        assert!(tree.finalized());
        assert!(tree.contains(&genesis));
    }

    #[test]
    fn test_add_extends_tail() {
        let genesis = hash(b"genesis");
        let a = hash(b"a");
        let b = hash(b"b");
        let mut tree = Topological::new(PARAMS, genesis);

        assert!(tree.add(a, genesis));
        assert_eq!(tree.preference(), a);

        // A conflicting sibling does not displace the tail.
        assert!(tree.add(b, genesis));
        assert_eq!(tree.preference(), a);
        assert!(!tree.finalized());
    }

    #[test]
    fn test_add_with_pruned_parent() {
        let genesis = hash(b"genesis");
        let orphan = hash(b"orphan");
        let child = hash(b"child");
        let mut tree = Topological::new(PARAMS, genesis);
        assert!(!tree.add(child, orphan));
        assert!(!tree.contains(&child));
    }

    #[test]
    fn test_single_branch_convergence() {
        // Scenario: two children of the head, every sampled peer votes
        // for one of them for beta rounds.
        let genesis = hash(b"genesis");
        let a = hash(b"a");
        let b = hash(b"b");
        let mut tree = Topological::new(PARAMS, genesis);
        tree.add(a, genesis);
        tree.add(b, genesis);

        for round in 0..2 {
            let decisions = tree.record_poll(votes_for(a, 5));
            assert_eq!(decisions, Decisions::default(), "round {round}");
        }
        let decisions = tree.record_poll(votes_for(a, 5));
        assert_eq!(decisions.accepted, vec![a]);
        assert_eq!(decisions.rejected, vec![b]);
        assert_eq!(tree.preference(), a);
        assert_eq!(tree.head(), a);
        assert!(tree.finalized());
    }

    #[test]
    fn test_conflicting_proposals_then_flip() {
        // Scenario: two rounds vote b, then three rounds vote a.
        let genesis = hash(b"genesis");
        let a = hash(b"a");
        let b = hash(b"b");
        let mut tree = Topological::new(PARAMS, genesis);
        tree.add(a, genesis);
        tree.add(b, genesis);

        tree.record_poll(votes_for(b, 4));
        tree.record_poll(votes_for(b, 4));
        assert_eq!(tree.preference(), b);

        // The flip restarts the streak, so acceptance lands two rounds
        // later.
        let decisions = tree.record_poll(votes_for(a, 4));
        assert_eq!(decisions, Decisions::default());
        assert_eq!(tree.preference(), a);

        assert_eq!(tree.record_poll(votes_for(a, 4)), Decisions::default());
        let decisions = tree.record_poll(votes_for(a, 4));
        assert_eq!(decisions.accepted, vec![a]);
        assert_eq!(decisions.rejected, vec![b]);
    }

    #[test]
    fn test_empty_poll_falters_head() {
        let genesis = hash(b"genesis");
        let a = hash(b"a");
        let mut tree = Topological::new(PARAMS, genesis);
        tree.add(a, genesis);

        tree.record_poll(votes_for(a, 5));
        tree.record_poll(votes_for(a, 5));

        // An empty round decays the streak; finalization needs a fresh
        // beta run.
        assert_eq!(tree.record_poll(Bag::new()), Decisions::default());
        assert_eq!(tree.record_poll(votes_for(a, 5)), Decisions::default());
        assert_eq!(tree.record_poll(votes_for(a, 5)), Decisions::default());
        let decisions = tree.record_poll(votes_for(a, 5));
        assert_eq!(decisions.accepted, vec![a]);
    }

    #[test]
    fn test_votes_for_unknown_ids_are_dropped() {
        let genesis = hash(b"genesis");
        let a = hash(b"a");
        let mut tree = Topological::new(PARAMS, genesis);
        tree.add(a, genesis);

        let decisions = tree.record_poll(votes_for(hash(b"unknown"), 5));
        assert_eq!(decisions, Decisions::default());
        assert_eq!(tree.preference(), a);
    }

    #[test]
    fn test_votes_propagate_to_ancestors() {
        // Votes on a grandchild count for the child at the head's
        // snowball.
        let genesis = hash(b"genesis");
        let a = hash(b"a");
        let b = hash(b"b");
        let c = hash(b"c");
        let mut tree = Topological::new(PARAMS, genesis);
        tree.add(a, genesis);
        tree.add(b, genesis);
        tree.add(c, a);

        for _ in 0..2 {
            assert_eq!(tree.record_poll(votes_for(c, 5)), Decisions::default());
        }
        let decisions = tree.record_poll(votes_for(c, 5));
        // a finalizes at the head and c finalizes right behind it.
        assert_eq!(decisions.accepted, vec![a, c]);
        assert_eq!(decisions.rejected, vec![b]);
        assert_eq!(tree.preference(), c);
        assert!(tree.finalized());
    }

    #[test]
    fn test_transitive_rejection() {
        let genesis = hash(b"genesis");
        let a = hash(b"a");
        let b = hash(b"b");
        let b1 = hash(b"b1");
        let b2 = hash(b"b2");
        let mut tree = Topological::new(PARAMS, genesis);
        tree.add(a, genesis);
        tree.add(b, genesis);
        tree.add(b1, b);
        tree.add(b2, b1);

        for _ in 0..2 {
            tree.record_poll(votes_for(a, 5));
        }
        let decisions = tree.record_poll(votes_for(a, 5));
        assert_eq!(decisions.accepted, vec![a]);
        // The whole rival branch is pruned.
        assert_eq!(decisions.rejected.len(), 3);
        assert!(decisions.rejected.contains(&b));
        assert!(decisions.rejected.contains(&b1));
        assert!(decisions.rejected.contains(&b2));
        assert!(!tree.contains(&b2));
        assert!(tree.finalized());
    }

    #[test]
    fn test_votes_amortize_across_grandchildren() {
        // Neither grandchild has an alpha majority of its own, but
        // their combined votes advance the decision at the head.
        let genesis = hash(b"genesis");
        let a = hash(b"a");
        let b = hash(b"b");
        let c1 = hash(b"c1");
        let c2 = hash(b"c2");
        let mut tree = Topological::new(PARAMS, genesis);
        tree.add(a, genesis);
        tree.add(b, genesis);
        tree.add(c1, a);
        tree.add(c2, a);

        let mut last = Decisions::default();
        for _ in 0..3 {
            let mut votes = Bag::new();
            votes.add_count(c1, 2);
            votes.add_count(c2, 3);
            last = tree.record_poll(votes);
        }
        assert_eq!(last.accepted, vec![a]);
        assert_eq!(last.rejected, vec![b]);
        // The decision among the grandchildren is still open.
        assert!(!tree.finalized());
        assert!(tree.contains(&c1) && tree.contains(&c2));
        assert_eq!(tree.head(), a);
    }

    #[test]
    fn test_split_votes_make_no_progress() {
        let genesis = hash(b"genesis");
        let a = hash(b"a");
        let b = hash(b"b");
        let mut tree = Topological::new(PARAMS, genesis);
        tree.add(a, genesis);
        tree.add(b, genesis);

        for _ in 0..10 {
            let mut votes = Bag::new();
            votes.add_count(a, 2);
            votes.add_count(b, 2);
            // Votes reach the head (4 >= alpha) but no child has an
            // alpha majority of its own.
            assert_eq!(tree.record_poll(votes), Decisions::default());
        }
        assert!(!tree.finalized());
    }
}
