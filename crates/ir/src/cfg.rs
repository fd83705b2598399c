//! Traversal utilities over a function's block graph.
use cranelift_entity::SecondaryMap;

use crate::function::{BlockId, Function};

/// Post-order traversal of the reachable blocks, starting at the entry.
pub fn post_order(func: &Function) -> PostOrder<'_> {
    PostOrder::new(func)
}

/// Reverse post-order of the reachable blocks.
pub fn reverse_post_order(func: &Function) -> Vec<BlockId> {
    let mut order: Vec<_> = post_order(func).collect();
    order.reverse();
    order
}

pub struct PostOrder<'a> {
    func: &'a Function,
    node_state: SecondaryMap<BlockId, NodeState>,
    stack: Vec<BlockId>,
}

impl<'a> PostOrder<'a> {
    fn new(func: &'a Function) -> Self {
        let mut stack = Vec::new();
        if let Some(entry) = func.entry.expand() {
            stack.push(entry);
        }

        Self {
            func,
            node_state: SecondaryMap::default(),
            stack,
        }
    }
}

impl Iterator for PostOrder<'_> {
    type Item = BlockId;

    fn next(&mut self) -> Option<BlockId> {
        while let Some(&block) = self.stack.last() {
            if self.node_state[block].is_unvisited() {
                self.node_state[block].set_visited();
                for succ in self.func.succs_of(block) {
                    if self.node_state[succ].is_unvisited() {
                        self.stack.push(succ);
                    }
                }
            } else {
                self.stack.pop().unwrap();
                if !self.node_state[block].has_finished() {
                    self.node_state[block].set_finished();
                    return Some(block);
                }
            }
        }

        None
    }
}

#[derive(Default, Debug, Clone, Copy)]
struct NodeState(u8);

impl NodeState {
    fn is_unvisited(self) -> bool {
        self.0 == 0
    }

    fn has_finished(self) -> bool {
        self.0 == 2
    }

    fn set_visited(&mut self) {
        self.0 = 1;
    }

    fn set_finished(&mut self) {
        self.0 = 2;
    }
}
