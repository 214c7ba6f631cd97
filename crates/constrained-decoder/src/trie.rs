//! Prefix tree over answer token sequences.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
struct Node {
    children: BTreeMap<u32, usize>,
    /// Index of the answer whose token sequence ends here.
    terminal: Option<usize>,
}

/// Trie of allowed token sequences.
///
/// Node `0` is the root. Children are kept ordered by token id, so iteration
/// (and therefore beam search tie-breaking) is deterministic.
#[derive(Debug, Clone)]
pub struct AnswerTrie {
    nodes: Vec<Node>,
    sequences: Vec<Vec<u32>>,
    max_depth: usize,
}

impl Default for AnswerTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl AnswerTrie {
    pub const ROOT: usize = 0;

    pub fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
            sequences: Vec::new(),
            max_depth: 0,
        }
    }

    /// Insert a sequence for answer `answer`.
    ///
    /// Returns the answer index already stored for an identical sequence,
    /// in which case nothing changes. Empty sequences are ignored.
    pub fn insert(&mut self, tokens: &[u32], answer: usize) -> Option<usize> {
        if tokens.is_empty() {
            return None;
        }
        let mut node = Self::ROOT;
        for &tok in tokens {
            node = match self.nodes[node].children.get(&tok) {
                Some(&next) => next,
                None => {
                    let next = self.nodes.len();
                    self.nodes.push(Node::default());
                    self.nodes[node].children.insert(tok, next);
                    next
                }
            };
        }
        if let Some(existing) = self.nodes[node].terminal {
            return Some(existing);
        }
        self.nodes[node].terminal = Some(answer);
        self.sequences.push(tokens.to_vec());
        self.max_depth = self.max_depth.max(tokens.len());
        None
    }

    /// Number of distinct sequences.
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Longest stored sequence.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Stored sequences in insertion order.
    pub fn sequences(&self) -> &[Vec<u32>] {
        &self.sequences
    }

    pub fn child(&self, node: usize, token: u32) -> Option<usize> {
        self.nodes.get(node)?.children.get(&token).copied()
    }

    /// `(token, child)` pairs allowed after `node`.
    pub fn children(&self, node: usize) -> impl Iterator<Item = (u32, usize)> + '_ {
        self.nodes
            .get(node)
            .into_iter()
            .flat_map(|n| n.children.iter().map(|(&t, &c)| (t, c)))
    }

    pub fn has_children(&self, node: usize) -> bool {
        self.nodes.get(node).is_some_and(|n| !n.children.is_empty())
    }

    pub fn terminal(&self, node: usize) -> Option<usize> {
        self.nodes.get(node)?.terminal
    }

    /// Walk `tokens` from the root.
    pub fn walk(&self, tokens: &[u32]) -> Option<usize> {
        tokens
            .iter()
            .try_fold(Self::ROOT, |node, &tok| self.child(node, tok))
    }

    /// Answer index of an exact stored sequence.
    pub fn lookup(&self, tokens: &[u32]) -> Option<usize> {
        self.terminal(self.walk(tokens)?)
    }

    /// Build from a list of sequences, answer index = position.
    pub fn from_sequences<S: AsRef<[u32]>>(sequences: &[S]) -> Self {
        let mut trie = Self::new();
        for (i, s) in sequences.iter().enumerate() {
            trie.insert(s.as_ref(), i);
        }
        trie
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_prefix() {
        let trie = AnswerTrie::from_sequences(&[vec![5, 6], vec![5, 7, 8], vec![9]]);
        assert_eq!(trie.len(), 3);
        assert_eq!(trie.max_depth(), 3);

        let after5 = trie.walk(&[5]).unwrap();
        let next: Vec<u32> = trie.children(after5).map(|(t, _)| t).collect();
        assert_eq!(next, vec![6, 7]);
        assert_eq!(trie.terminal(after5), None);

        assert_eq!(trie.lookup(&[5, 7, 8]), Some(1));
        assert_eq!(trie.lookup(&[5, 7]), None);
        assert_eq!(trie.lookup(&[4]), None);
    }

    #[test]
    fn test_duplicate_sequence_keeps_first() {
        let mut trie = AnswerTrie::new();
        assert_eq!(trie.insert(&[1, 2], 0), None);
        assert_eq!(trie.insert(&[1, 2], 3), Some(0));
        assert_eq!(trie.len(), 1);
        assert_eq!(trie.lookup(&[1, 2]), Some(0));
    }

    #[test]
    fn test_prefix_candidate_is_terminal_and_open() {
        let trie = AnswerTrie::from_sequences(&[vec![3], vec![3, 4]]);
        let n = trie.walk(&[3]).unwrap();
        assert_eq!(trie.terminal(n), Some(0));
        assert!(trie.has_children(n));
    }
}
