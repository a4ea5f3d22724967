//! Graph utilities: reverse postorder, spanning trees, nearest common
//! ancestors and dominator trees.
//!
//! Everything here is iterative with explicit work stacks; wasm
//! functions routinely nest deep enough to overflow the call stack
//! otherwise.

use std::collections::BTreeMap;

pub type Node = u32;
pub type Adjacency = BTreeMap<Node, Vec<Node>>;

/// A rooted tree over graph nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    pub root: Node,
    pub parent: BTreeMap<Node, Node>,
    pub children: BTreeMap<Node, Vec<Node>>,
}

impl Tree {
    fn from_parents(root: Node, parent: BTreeMap<Node, Node>) -> Tree {
        let mut children: BTreeMap<Node, Vec<Node>> = BTreeMap::new();
        for (&child, &par) in &parent {
            children.entry(par).or_default().push(child);
        }
        Tree { root, parent, children }
    }

    pub fn children_of(&self, n: Node) -> &[Node] {
        self.children.get(&n).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Depth of every node below the root, computed without recursion.
    pub fn depths(&self) -> BTreeMap<Node, usize> {
        let mut depths = BTreeMap::new();
        let mut stack = vec![(self.root, 0usize)];
        while let Some((n, d)) = stack.pop() {
            depths.insert(n, d);
            for &c in self.children_of(n) {
                stack.push((c, d + 1));
            }
        }
        depths
    }

    /// Nearest common ancestor of two nodes, by lifting the deeper one.
    pub fn nca(&self, a: Node, b: Node) -> Option<Node> {
        let depths = self.depths();
        let mut a = a;
        let mut b = b;
        let mut da = *depths.get(&a)?;
        let mut db = *depths.get(&b)?;
        while da > db {
            a = self.parent[&a];
            da -= 1;
        }
        while db > da {
            b = self.parent[&b];
            db -= 1;
        }
        while a != b {
            a = *self.parent.get(&a)?;
            b = *self.parent.get(&b)?;
        }
        Some(a)
    }

    /// Whether `anc` lies on the path from the root to `n` (inclusive).
    pub fn is_ancestor(&self, anc: Node, n: Node) -> bool {
        let mut cur = n;
        loop {
            if cur == anc {
                return true;
            }
            match self.parent.get(&cur) {
                Some(&p) => cur = p,
                None => return false,
            }
        }
    }
}

fn succs(adj: &Adjacency, n: Node) -> &[Node] {
    adj.get(&n).map(Vec::as_slice).unwrap_or(&[])
}

/// Reverse postorder of the nodes reachable from `root`.
pub fn reverse_postorder(adj: &Adjacency, root: Node) -> Vec<Node> {
    // Iterative DFS; the second stack slot tracks how far into the
    // successor list we are.
    let mut post = Vec::new();
    let mut visited = BTreeMap::new();
    let mut stack: Vec<(Node, usize)> = vec![(root, 0)];
    visited.insert(root, true);
    while let Some((n, i)) = stack.pop() {
        let ss = succs(adj, n);
        if i < ss.len() {
            stack.push((n, i + 1));
            let s = ss[i];
            if visited.insert(s, true).is_none() {
                stack.push((s, 0));
            }
        } else {
            post.push(n);
        }
    }
    post.reverse();
    post
}

/// A DFS spanning tree rooted at `root`.
pub fn spanning_tree(adj: &Adjacency, root: Node) -> Tree {
    let mut parent = BTreeMap::new();
    let mut visited = BTreeMap::new();
    let mut stack = vec![root];
    visited.insert(root, true);
    while let Some(n) = stack.pop() {
        for &s in succs(adj, n) {
            if visited.insert(s, true).is_none() {
                parent.insert(s, n);
                stack.push(s);
            }
        }
    }
    Tree::from_parents(root, parent)
}

/// Dominator tree by the Cooper–Harvey–Kennedy iteration.
///
/// `preds` must be the predecessor adjacency of the graph whose
/// dominators are wanted; pass the *forward* edges as `preds` (and the
/// exit as root) to get post-dominators.
pub fn dominator_tree(succ_adj: &Adjacency, pred_adj: &Adjacency, root: Node) -> Tree {
    let order = reverse_postorder(succ_adj, root);
    let index: BTreeMap<Node, usize> =
        order.iter().enumerate().map(|(i, &n)| (n, i)).collect();

    let mut idom: BTreeMap<Node, Node> = BTreeMap::new();
    idom.insert(root, root);

    let intersect = |idom: &BTreeMap<Node, Node>, mut a: Node, mut b: Node| -> Node {
        while a != b {
            while index[&a] > index[&b] {
                a = idom[&a];
            }
            while index[&b] > index[&a] {
                b = idom[&b];
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &n in order.iter().skip(1) {
            let mut new_idom: Option<Node> = None;
            for &p in succs(pred_adj, n) {
                if !index.contains_key(&p) {
                    continue;
                }
                if idom.contains_key(&p) {
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => intersect(&idom, cur, p),
                    });
                }
            }
            if let Some(d) = new_idom {
                if idom.get(&n) != Some(&d) {
                    idom.insert(n, d);
                    changed = true;
                }
            }
        }
    }

    idom.remove(&root);
    Tree::from_parents(root, idom)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adj(edges: &[(Node, Node)]) -> Adjacency {
        let mut a = Adjacency::new();
        for &(s, d) in edges {
            a.entry(s).or_default().push(d);
        }
        a
    }

    fn reversed(edges: &[(Node, Node)]) -> Adjacency {
        let flipped: Vec<(Node, Node)> = edges.iter().map(|&(s, d)| (d, s)).collect();
        adj(&flipped)
    }

    #[test]
    fn dominators_of_diamond_with_loop() {
        // 1→2; 2→{3,4,6}; 3→5; 4→5; 5→2.
        let edges = [(1, 2), (2, 3), (2, 4), (2, 6), (3, 5), (4, 5), (5, 2)];
        let fwd = adj(&edges);
        let bwd = reversed(&edges);
        let tree = dominator_tree(&fwd, &bwd, 1);
        assert_eq!(tree.parent[&2], 1);
        assert_eq!(tree.parent[&3], 2);
        assert_eq!(tree.parent[&4], 2);
        assert_eq!(tree.parent[&5], 2);
        assert_eq!(tree.parent[&6], 2);
    }

    #[test]
    fn dominator_is_on_every_path() {
        // For each reachable node, removing its idom disconnects it
        // from the root.
        let edges = [(0, 1), (0, 2), (1, 3), (2, 3), (3, 4), (4, 1)];
        let fwd = adj(&edges);
        let bwd = reversed(&edges);
        let tree = dominator_tree(&fwd, &bwd, 0);
        for (&n, &dom) in &tree.parent {
            // Remove the dominator from the graph and check that the
            // node became unreachable from the root.
            let mut seen = std::collections::BTreeSet::new();
            seen.insert(dom);
            let mut reach = if dom == 0 { Vec::new() } else { vec![0u32] };
            seen.insert(0);
            let mut found = false;
            while let Some(x) = reach.pop() {
                if x == n {
                    found = true;
                    break;
                }
                for &s in fwd.get(&x).map(Vec::as_slice).unwrap_or(&[]) {
                    if seen.insert(s) {
                        reach.push(s);
                    }
                }
            }
            assert!(!found, "node {n} reachable without its dominator {dom}");
        }
    }

    #[test]
    fn nca_in_spanning_tree() {
        let edges = [(0, 1), (1, 2), (1, 3), (3, 4)];
        let tree = spanning_tree(&adj(&edges), 0);
        assert_eq!(tree.nca(2, 4), Some(1));
        assert_eq!(tree.nca(2, 2), Some(2));
        assert_eq!(tree.nca(0, 4), Some(0));
    }

    #[test]
    fn postdominators_use_forward_edges_as_preds() {
        // 0→1→3, 0→2→3: 3 post-dominates everything.
        let edges = [(0, 1), (0, 2), (1, 3), (2, 3)];
        let fwd = adj(&edges);
        let bwd = reversed(&edges);
        let tree = dominator_tree(&bwd, &fwd, 3);
        assert_eq!(tree.parent[&1], 3);
        assert_eq!(tree.parent[&2], 3);
        assert_eq!(tree.parent[&0], 3);
    }
}
